//! Batch rating engine.
//!
//! A run resolves the configured library names once, then pages through each
//! library newest-first until `batch_size` tracks have been examined. A full
//! override run passes over tracks already at the target without counting
//! them. Writes of a page are fanned out to a bounded number of concurrent
//! Plex calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::models::{RunKind, RunOutcome, RunScope, RunSummary, RunTrigger};
use super::retry_policy::RetryPolicy;
use crate::activity_log::ActivityLog;
use crate::plex::{Library, PlexApi, PlexError, Track, TrackFilter, TrackQuery};
use crate::server::metrics;
use crate::settings::{Settings, RATING_EPSILON};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum number of rating writes in flight.
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Identity of the run being executed.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: u64,
    pub kind: RunKind,
    pub trigger: RunTrigger,
    /// Checked between pages, a cancelled run stops early.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    Skip,
    Write { overwrite: bool },
}

/// What happens to each track, `target: None` means clearing the rating.
fn decide(track: &Track, target: Option<f64>, override_rating: bool) -> Decision {
    let Some(target) = target else {
        return if track.is_rated() {
            Decision::Write { overwrite: false }
        } else {
            Decision::Skip
        };
    };

    if let Some(current) = track.user_rating {
        if (current - target).abs() < RATING_EPSILON {
            return Decision::Skip;
        }
    }
    match (track.is_rated(), override_rating) {
        (false, _) => Decision::Write { overwrite: false },
        (true, true) => Decision::Write { overwrite: true },
        (true, false) => Decision::Skip,
    }
}

#[derive(Debug, Default)]
struct Tally {
    libraries_processed: Vec<String>,
    examined: usize,
    rated: usize,
    overwritten: usize,
    skipped: usize,
    failed: usize,
    warnings: Vec<String>,
    listing_failed: bool,
}

enum RunError {
    /// The run stopped, `String` is the reason shown in the summary.
    Aborted(String),
    Cancelled,
}

enum LibraryError {
    Listing(PlexError),
    Cancelled,
}

#[derive(Clone)]
pub struct RatingEngine {
    plex: Arc<dyn PlexApi>,
    activity: ActivityLog,
    options: EngineOptions,
}

impl RatingEngine {
    pub fn new(plex: Arc<dyn PlexApi>, activity: ActivityLog, options: EngineOptions) -> Self {
        Self {
            plex,
            activity,
            options,
        }
    }

    /// Executes a run to completion. Never fails: every problem ends up in
    /// the returned summary.
    pub async fn run(&self, ctx: &RunContext, settings: &Settings) -> RunSummary {
        let started_at = Utc::now();
        let started = Instant::now();
        self.activity.info(format!(
            "Run #{}: starting {} ({} trigger)",
            ctx.run_id, ctx.kind, ctx.trigger
        ));

        let mut tally = Tally::default();
        let result = self.execute(ctx, settings, &mut tally).await;

        let (outcome, error) = match result {
            Ok(()) if tally.failed > 0 || tally.listing_failed => (RunOutcome::PartialFailure, None),
            Ok(()) => (RunOutcome::Success, None),
            Err(RunError::Cancelled) => (
                RunOutcome::PartialFailure,
                Some("Run cancelled by shutdown".to_string()),
            ),
            Err(RunError::Aborted(reason)) if tally.rated == 0 => {
                (RunOutcome::Failure, Some(reason))
            }
            Err(RunError::Aborted(reason)) => (RunOutcome::PartialFailure, Some(reason)),
        };

        let elapsed = started.elapsed();
        let summary = RunSummary {
            run_id: ctx.run_id,
            kind: ctx.kind.clone(),
            trigger: ctx.trigger,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            duration_ms: elapsed.as_millis() as u64,
            libraries_processed: tally.libraries_processed,
            examined: tally.examined,
            rated: tally.rated,
            overwritten: tally.overwritten,
            skipped: tally.skipped,
            failed: tally.failed,
            warnings: tally.warnings,
            outcome,
            error,
        };

        let written_label = match ctx.kind {
            RunKind::Reset => "reset",
            RunKind::Rate { .. } => "rated",
        };
        metrics::record_tracks(written_label, summary.rated);
        metrics::record_tracks("overwritten", summary.overwritten);
        metrics::record_tracks("skipped", summary.skipped);
        metrics::record_tracks("failed", summary.failed);

        let line = format!(
            "Run #{} finished ({}): examined {}, {} {} ({} overwritten), skipped {}, failed {}",
            summary.run_id,
            outcome.as_str(),
            summary.examined,
            written_label,
            summary.rated,
            summary.overwritten,
            summary.skipped,
            summary.failed,
        );
        match (&summary.error, outcome) {
            (Some(reason), _) => self.activity.warn(format!("{} - {}", line, reason)),
            (None, RunOutcome::Success) => self.activity.info(line),
            (None, _) => self.activity.warn(line),
        }

        summary
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        settings: &Settings,
        tally: &mut Tally,
    ) -> Result<(), RunError> {
        let target = match ctx.kind {
            RunKind::Rate { .. } => Some(
                settings
                    .target_plex_rating()
                    .map_err(|e| RunError::Aborted(e.to_string()))?,
            ),
            RunKind::Reset => None,
        };
        if target == Some(0.0) {
            self.warning(
                tally,
                "Target rating 0 reads as unrated in Plex, nothing to apply".to_string(),
            );
            return Ok(());
        }

        let libraries = self
            .with_retry("list_libraries", || self.plex.list_libraries())
            .await
            .map_err(|e| RunError::Aborted(format!("Plex unavailable: {}", e)))?;

        let resolved = self.resolve_libraries(ctx, settings, &libraries, tally);
        if resolved.is_empty() {
            self.activity.info("No libraries to process");
        }

        let mut remaining = settings.batch_size;
        for library in resolved {
            if remaining == 0 {
                debug!("Batch size reached, skipping library '{}'", library.name);
                break;
            }
            if ctx.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            match self
                .process_library(ctx, settings, target, library, &mut remaining, tally)
                .await
            {
                Ok(()) => tally.libraries_processed.push(library.name.clone()),
                Err(LibraryError::Cancelled) => return Err(RunError::Cancelled),
                Err(LibraryError::Listing(e)) if e.is_transient() => {
                    tally.listing_failed = true;
                    self.warning(
                        tally,
                        format!("Skipping rest of library '{}': {}", library.name, e),
                    );
                }
                Err(LibraryError::Listing(e)) => {
                    return Err(RunError::Aborted(format!(
                        "Listing tracks of '{}' failed: {}",
                        library.name, e
                    )));
                }
            }
        }

        Ok(())
    }

    fn resolve_libraries<'a>(
        &self,
        ctx: &RunContext,
        settings: &Settings,
        available: &'a [Library],
        tally: &mut Tally,
    ) -> Vec<&'a Library> {
        let wanted: Vec<&String> = match &ctx.kind {
            RunKind::Rate {
                scope:
                    RunScope::LastBatch {
                        library: Some(only),
                    },
            } => {
                let configured: Vec<&String> =
                    settings.libraries.iter().filter(|l| *l == only).collect();
                if configured.is_empty() {
                    self.warning(tally, format!("Library '{}' is not configured", only));
                }
                configured
            }
            _ => settings.libraries.iter().collect(),
        };

        let mut resolved: Vec<&Library> = Vec::with_capacity(wanted.len());
        for name in wanted {
            match available.iter().find(|l| &l.name == name) {
                Some(library) if !library.is_music() => {
                    self.warning(tally, format!("Library '{}' is not a music library", name));
                }
                Some(library) => {
                    if !resolved.iter().any(|r| r.id == library.id) {
                        resolved.push(library);
                    }
                }
                None => {
                    self.warning(tally, format!("Library '{}' not found on Plex", name));
                }
            }
        }
        resolved
    }

    async fn process_library(
        &self,
        ctx: &RunContext,
        settings: &Settings,
        target: Option<f64>,
        library: &Library,
        remaining: &mut usize,
        tally: &mut Tally,
    ) -> Result<(), LibraryError> {
        let filter = match (&ctx.kind, settings.override_rating) {
            (RunKind::Reset, _) => TrackFilter::RatedOnly,
            (
                RunKind::Rate {
                    scope: RunScope::Full,
                },
                false,
            ) => TrackFilter::UnratedOnly,
            (RunKind::Rate { .. }, _) => TrackFilter::All,
        };
        // Tracks already at the target do not count toward the ceiling of a
        // full override run.
        let pass_over_at_target = matches!(
            ctx.kind,
            RunKind::Rate {
                scope: RunScope::Full
            }
        ) && settings.override_rating;

        let mut offset = 0;
        while *remaining > 0 {
            if ctx.cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }

            let size = if pass_over_at_target {
                settings.batch_size
            } else {
                (*remaining).min(settings.batch_size)
            };
            let query = TrackQuery::recently_added(filter, offset, size);
            let page = self
                .with_retry("list_tracks", || self.plex.list_tracks(&library.id, &query))
                .await
                .map_err(LibraryError::Listing)?;

            let total_size = page.total_size;
            let page_len = page.tracks.len().min(size);
            if page_len == 0 {
                break;
            }

            let mut writes = Vec::new();
            let mut skipped = 0;
            let mut scanned = 0;
            for track in page.tracks.into_iter().take(size) {
                if *remaining == 0 {
                    break;
                }
                scanned += 1;
                match decide(&track, target, settings.override_rating) {
                    Decision::Skip if pass_over_at_target => skipped += 1,
                    Decision::Skip => {
                        skipped += 1;
                        *remaining -= 1;
                        tally.examined += 1;
                    }
                    Decision::Write { overwrite } => {
                        writes.push((track, overwrite));
                        *remaining -= 1;
                        tally.examined += 1;
                    }
                }
            }
            tally.skipped += skipped;

            let results: Vec<(Track, bool, Result<(), PlexError>)> = stream::iter(writes)
                .map(|(track, overwrite)| async move {
                    let result = self.write_track(&track, target).await;
                    (track, overwrite, result)
                })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;

            let mut written = 0;
            let mut left_filter = 0;
            for (track, overwrite, result) in results {
                match result {
                    Ok(()) => {
                        written += 1;
                        if overwrite {
                            tally.overwritten += 1;
                        }
                        let updated = Track {
                            user_rating: target,
                            ..track
                        };
                        if !filter.matches(&updated) {
                            left_filter += 1;
                        }
                    }
                    Err(e) => {
                        tally.failed += 1;
                        self.activity
                            .warn(format!("Failed to update '{}' ({}): {}", track.title, track.id, e));
                    }
                }
            }
            tally.rated += written;

            self.activity.info(format!(
                "{}: examined {} tracks, {} {}, skipped {}",
                library.name,
                scanned,
                match target {
                    Some(_) => "rated",
                    None => "cleared",
                },
                written,
                skipped
            ));

            // Tracks that just left the filtered set shift the rest of it back
            offset += scanned - left_filter;
            if page_len < size || offset >= total_size.saturating_sub(left_filter) {
                break;
            }
        }

        Ok(())
    }

    async fn write_track(&self, track: &Track, target: Option<f64>) -> Result<(), PlexError> {
        match target {
            Some(value) => {
                debug!("Rating '{}' ({}) with {}", track.title, track.id, value);
                self.with_retry("set_rating", || self.plex.set_rating(&track.id, value))
                    .await
            }
            None => {
                debug!("Clearing rating of '{}' ({})", track.title, track.id);
                self.with_retry("reset_rating", || self.plex.reset_rating(&track.id))
                    .await
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, PlexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlexError>>,
    {
        let policy = &self.options.retry_policy;
        let mut retry_count = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    metrics::record_plex_error(operation, e.kind());
                    if !policy.should_retry(&e, retry_count) {
                        return Err(e);
                    }
                    let backoff = policy.backoff(retry_count);
                    warn!(
                        "Plex {} failed ({}), retrying in {:?}",
                        operation, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    retry_count += 1;
                }
            }
        }
    }

    fn warning(&self, tally: &mut Tally, text: String) {
        self.activity.warn(&text);
        tally.warnings.push(text);
    }
}
