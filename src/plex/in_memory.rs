//! In-process `PlexApi` implementation.
//!
//! Holds libraries and tracks in memory and applies filtering, sorting and
//! paging the way the real server does. Failures, pauses and slow writes can
//! be injected to exercise the rating engine and the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::api::{PlexApi, PlexError};
use super::models::{Library, Track, TrackPage, TrackQuery, TrackSort, MUSIC_SECTION_TYPE};

struct StoredTrack {
    library_id: String,
    /// Insertion sequence, higher means more recently added.
    added: u64,
    track: Track,
}

struct FailurePlan {
    error: PlexError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

impl FailurePlan {
    fn fire(&mut self) -> Option<PlexError> {
        match self.remaining.as_mut() {
            None => Some(self.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.error.clone())
            }
        }
    }
}

#[derive(Default)]
struct State {
    libraries: Vec<Library>,
    tracks: Vec<StoredTrack>,
    next_added: u64,
    unavailable: bool,
    listing_failures: HashMap<String, FailurePlan>,
    write_failures: HashMap<String, FailurePlan>,
    write_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub ratings_set: usize,
    pub ratings_reset: usize,
    pub failed: usize,
    pub max_concurrent: usize,
}

pub struct InMemoryPlex {
    state: Mutex<State>,
    paused: watch::Sender<bool>,
    ratings_set: AtomicUsize,
    ratings_reset: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryPlex {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlex {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            paused,
            ratings_set: AtomicUsize::new(0),
            ratings_reset: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a library section and returns its id.
    pub fn add_library(&self, name: &str, kind: &str) -> String {
        let mut state = self.state();
        let id = (state.libraries.len() + 1).to_string();
        state.libraries.push(Library::new(id.clone(), name, kind));
        id
    }

    pub fn add_music_library(&self, name: &str) -> String {
        self.add_library(name, MUSIC_SECTION_TYPE)
    }

    /// Adds tracks to a library. Later tracks count as more recently added.
    pub fn add_tracks(&self, library_id: &str, tracks: impl IntoIterator<Item = Track>) {
        let mut state = self.state();
        for track in tracks {
            let added = state.next_added;
            state.next_added += 1;
            state.tracks.push(StoredTrack {
                library_id: library_id.to_string(),
                added,
                track,
            });
        }
    }

    /// Adds `count` tracks with ids `{library_id}-{n}` and returns the ids.
    pub fn add_generated_tracks(
        &self,
        library_id: &str,
        count: usize,
        rating: Option<f64>,
    ) -> Vec<String> {
        let start = self
            .state()
            .tracks
            .iter()
            .filter(|t| t.library_id == library_id)
            .count();
        let tracks: Vec<Track> = (start..start + count)
            .map(|n| {
                Track::new(
                    format!("{}-{}", library_id, n),
                    format!("Track {}", n),
                    rating,
                )
            })
            .collect();
        let ids = tracks.iter().map(|t| t.id.clone()).collect();
        self.add_tracks(library_id, tracks);
        ids
    }

    pub fn track(&self, track_id: &str) -> Option<Track> {
        self.state()
            .tracks
            .iter()
            .find(|t| t.track.id == track_id)
            .map(|t| t.track.clone())
    }

    /// Tracks of a library, most recently added first.
    pub fn tracks(&self, library_id: &str) -> Vec<Track> {
        let state = self.state();
        let mut stored: Vec<&StoredTrack> = state
            .tracks
            .iter()
            .filter(|t| t.library_id == library_id)
            .collect();
        stored.sort_by(|a, b| b.added.cmp(&a.added));
        stored.into_iter().map(|t| t.track.clone()).collect()
    }

    /// Makes every call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fails track listings of a library, `times: None` fails forever.
    pub fn fail_listing(&self, library_id: &str, error: PlexError, times: Option<usize>) {
        self.state().listing_failures.insert(
            library_id.to_string(),
            FailurePlan {
                error,
                remaining: times,
            },
        );
    }

    /// Fails writes to a track, `times: None` fails forever.
    pub fn fail_writes(&self, track_id: &str, error: PlexError, times: Option<usize>) {
        self.state().write_failures.insert(
            track_id.to_string(),
            FailurePlan {
                error,
                remaining: times,
            },
        );
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state().write_delay = delay;
    }

    /// Blocks all writes until `resume_writes` is called.
    pub fn pause_writes(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.paused.send_replace(false);
    }

    pub fn write_stats(&self) -> WriteStats {
        WriteStats {
            ratings_set: self.ratings_set.load(Ordering::SeqCst),
            ratings_reset: self.ratings_reset.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            max_concurrent: self.max_in_flight.load(Ordering::SeqCst),
        }
    }

    fn check_available(&self) -> Result<(), PlexError> {
        if self.state().unavailable {
            return Err(PlexError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn write(&self, track_id: &str, rating: Option<f64>) -> Result<(), PlexError> {
        let mut paused = self.paused.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = paused.wait_for(|p| !*p).await;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let result = self.apply_write(track_id, rating).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_err() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn apply_write(&self, track_id: &str, rating: Option<f64>) -> Result<(), PlexError> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.unavailable {
            return Err(PlexError::Connection("connection refused".to_string()));
        }
        if let Some(err) = state
            .write_failures
            .get_mut(track_id)
            .and_then(FailurePlan::fire)
        {
            return Err(err);
        }

        let stored = state
            .tracks
            .iter_mut()
            .find(|t| t.track.id == track_id)
            .ok_or_else(|| PlexError::Status {
                status: 404,
                message: format!("no track {}", track_id),
            })?;
        stored.track.user_rating = rating;
        drop(state);

        match rating {
            Some(_) => self.ratings_set.fetch_add(1, Ordering::SeqCst),
            None => self.ratings_reset.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    }
}

#[async_trait]
impl PlexApi for InMemoryPlex {
    async fn list_libraries(&self) -> Result<Vec<Library>, PlexError> {
        self.check_available()?;
        Ok(self.state().libraries.clone())
    }

    async fn list_tracks(
        &self,
        library_id: &str,
        query: &TrackQuery,
    ) -> Result<TrackPage, PlexError> {
        self.check_available()?;
        let mut state = self.state();

        if let Some(err) = state
            .listing_failures
            .get_mut(library_id)
            .and_then(FailurePlan::fire)
        {
            return Err(err);
        }
        if !state.libraries.iter().any(|l| l.id == library_id) {
            return Err(PlexError::Status {
                status: 404,
                message: format!("no section {}", library_id),
            });
        }

        let mut matching: Vec<&StoredTrack> = state
            .tracks
            .iter()
            .filter(|t| t.library_id == library_id && query.filter.matches(&t.track))
            .collect();
        match query.sort {
            TrackSort::RecentlyAdded => matching.sort_by(|a, b| b.added.cmp(&a.added)),
        }

        let total_size = matching.len();
        let tracks = matching
            .into_iter()
            .skip(query.offset)
            .take(query.size)
            .map(|t| t.track.clone())
            .collect();
        Ok(TrackPage { tracks, total_size })
    }

    async fn set_rating(&self, track_id: &str, rating: f64) -> Result<(), PlexError> {
        self.write(track_id, Some(rating)).await
    }

    async fn reset_rating(&self, track_id: &str) -> Result<(), PlexError> {
        self.write(track_id, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plex::TrackFilter;

    #[tokio::test]
    async fn pages_most_recent_first_with_filters() {
        let plex = InMemoryPlex::new();
        let lib = plex.add_music_library("Music");
        plex.add_generated_tracks(&lib, 3, None);
        plex.add_generated_tracks(&lib, 2, Some(8.0));

        let page = plex
            .list_tracks(&lib, &TrackQuery::recently_added(TrackFilter::All, 0, 2))
            .await
            .unwrap();
        assert_eq!(page.total_size, 5);
        assert_eq!(
            page.tracks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["1-4", "1-3"]
        );

        let unrated = plex
            .list_tracks(&lib, &TrackQuery::recently_added(TrackFilter::UnratedOnly, 1, 10))
            .await
            .unwrap();
        assert_eq!(unrated.total_size, 3);
        assert_eq!(unrated.tracks.len(), 2);
        assert!(unrated.tracks.iter().all(|t| !t.is_rated()));
    }

    #[tokio::test]
    async fn writes_update_tracks_and_counters() {
        let plex = InMemoryPlex::new();
        let lib = plex.add_music_library("Music");
        let ids = plex.add_generated_tracks(&lib, 2, None);

        plex.set_rating(&ids[0], 6.0).await.unwrap();
        plex.reset_rating(&ids[0]).await.unwrap();
        plex.set_rating(&ids[1], 10.0).await.unwrap();

        assert_eq!(plex.track(&ids[0]).unwrap().user_rating, None);
        assert_eq!(plex.track(&ids[1]).unwrap().user_rating, Some(10.0));
        let stats = plex.write_stats();
        assert_eq!(stats.ratings_set, 2);
        assert_eq!(stats.ratings_reset, 1);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let plex = InMemoryPlex::new();
        let lib = plex.add_music_library("Music");
        let ids = plex.add_generated_tracks(&lib, 1, None);
        plex.fail_writes(&ids[0], PlexError::Timeout("slow".into()), Some(1));

        assert!(plex.set_rating(&ids[0], 6.0).await.is_err());
        assert!(plex.set_rating(&ids[0], 6.0).await.is_ok());
        assert_eq!(plex.write_stats().failed, 1);
    }

    #[tokio::test]
    async fn unavailable_server_fails_listing() {
        let plex = InMemoryPlex::new();
        plex.add_music_library("Music");
        plex.set_unavailable(true);

        let err = plex.list_libraries().await.unwrap_err();
        assert!(err.is_transient());
    }
}
