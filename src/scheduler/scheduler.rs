use super::gate::{ActiveRun, RunGate, RunPermit};
use super::handle::{SchedulerCommand, SchedulerHandle, SharedRunState, TriggerError};
use crate::activity_log::ActivityLog;
use crate::rating::{RatingEngine, RunContext, RunKind, RunOutcome, RunSummary, RunTrigger};
use crate::server::metrics;
use crate::settings::SettingsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-flight run.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the run gate and starts runs from manual, periodic and webhook
/// triggers, all of which arrive through the same command channel.
pub struct RunScheduler {
    engine: RatingEngine,
    settings: Arc<SettingsStore>,
    activity: ActivityLog,
    gate: RunGate,
    shared_state: Arc<RwLock<SharedRunState>>,
    command_receiver: mpsc::Receiver<SchedulerCommand>,
    shutdown_token: CancellationToken,
    next_run_id: u64,
    running: Option<JoinHandle<()>>,
    interval_minutes: u64,
    interval: Option<Duration>,
    next_tick: Option<Instant>,
}

impl RunScheduler {
    pub fn new(
        engine: RatingEngine,
        settings: Arc<SettingsStore>,
        activity: ActivityLog,
        gate: RunGate,
        shared_state: Arc<RwLock<SharedRunState>>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            settings,
            activity,
            gate,
            shared_state,
            command_receiver,
            shutdown_token,
            next_run_id: 1,
            running: None,
            interval_minutes: 0,
            interval: None,
            next_tick: None,
        }
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        let interval_minutes = self.settings.snapshot().batch_interval_minutes;
        self.arm_timer(interval_minutes).await;

        loop {
            let next_tick = self.next_tick;
            let tick = async move {
                match next_tick {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tick => {
                    self.on_tick().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Run scheduler stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Trigger {
                kind,
                trigger,
                response,
            } => {
                let result = self.try_start(kind, trigger);
                if let Err(TriggerError::Busy(active)) = &result {
                    info!(
                        "Rejected {} trigger, run #{} is in progress",
                        trigger, active
                    );
                    metrics::record_run_rejected(trigger.as_str());
                }
                let _ = response.send(result);
            }
            SchedulerCommand::Reschedule => {
                let interval_minutes = self.settings.snapshot().batch_interval_minutes;
                if interval_minutes != self.interval_minutes {
                    self.arm_timer(interval_minutes).await;
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        if let Some(interval) = self.interval {
            self.next_tick = Some(Instant::now() + interval);
            self.publish_next_tick().await;
        }

        match self.try_start(RunKind::full(), RunTrigger::Scheduled) {
            Ok(run_id) => debug!("Periodic trigger started run #{}", run_id),
            Err(TriggerError::Busy(active)) => {
                self.activity.info(format!(
                    "Periodic trigger skipped, run #{} is still in progress",
                    active
                ));
                metrics::record_run_rejected(RunTrigger::Scheduled.as_str());
            }
            Err(e) => warn!("Periodic trigger failed: {}", e),
        }
    }

    /// Sets the periodic interval and restarts the countdown from now.
    async fn arm_timer(&mut self, interval_minutes: u64) {
        self.interval_minutes = interval_minutes;
        self.interval = match interval_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };
        self.next_tick = self.interval.map(|interval| Instant::now() + interval);

        match self.interval {
            Some(_) => self.activity.info(format!(
                "Periodic trigger every {} minutes",
                interval_minutes
            )),
            None => self.activity.info("Periodic trigger disabled"),
        }

        self.shared_state.write().await.interval_minutes = interval_minutes;
        self.publish_next_tick().await;
    }

    async fn publish_next_tick(&self) {
        let next_tick_at = self.interval.map(|interval| {
            let interval = chrono::Duration::from_std(interval).unwrap_or_default();
            (chrono::Utc::now() + interval).to_rfc3339()
        });
        self.shared_state.write().await.next_tick_at = next_tick_at;
    }

    /// Starts a run if the gate is free. Never waits for the active run.
    fn try_start(&mut self, kind: RunKind, trigger: RunTrigger) -> Result<u64, TriggerError> {
        if self.shutdown_token.is_cancelled() {
            return Err(TriggerError::Unavailable);
        }

        let run_id = self.next_run_id;
        let started_at = chrono::Utc::now();
        let permit = self
            .gate
            .try_acquire(ActiveRun {
                run_id,
                kind: kind.clone(),
                trigger,
                started_at: started_at.to_rfc3339(),
            })
            .map_err(TriggerError::Busy)?;
        self.next_run_id += 1;

        let ctx = RunContext {
            run_id,
            kind,
            trigger,
            cancel: self.shutdown_token.child_token(),
        };
        // Later settings updates apply to the next run only
        let settings = self.settings.snapshot();
        let engine = self.engine.clone();
        let shared_state = Arc::clone(&self.shared_state);
        let activity = self.activity.clone();

        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let run_ctx = ctx.clone();
            let result = tokio::spawn(async move { engine.run(&run_ctx, &settings).await }).await;

            let summary = match result {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Run #{} panicked: {}", ctx.run_id, e);
                    activity.warn(format!("Run #{} crashed: {}", ctx.run_id, e));
                    crashed_summary(&ctx, started_at, started.elapsed(), e.to_string())
                }
            };

            metrics::record_run(
                summary.kind.label(),
                summary.trigger.as_str(),
                summary.outcome.as_str(),
                started.elapsed(),
            );
            shared_state.write().await.record(summary);
            release(permit);
        });

        self.running = Some(handle);
        Ok(run_id)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");
        if let Some(handle) = self.running.take() {
            if !handle.is_finished() {
                info!("Waiting for the active run to stop...");
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Active run did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
        info!("Scheduler shutdown complete");
    }
}

fn release(permit: RunPermit) {
    debug!("Run #{} released the gate", permit.run_id());
    drop(permit);
}

fn crashed_summary(
    ctx: &RunContext,
    started_at: chrono::DateTime<chrono::Utc>,
    elapsed: Duration,
    reason: String,
) -> RunSummary {
    RunSummary {
        run_id: ctx.run_id,
        kind: ctx.kind.clone(),
        trigger: ctx.trigger,
        started_at: started_at.to_rfc3339(),
        finished_at: chrono::Utc::now().to_rfc3339(),
        duration_ms: elapsed.as_millis() as u64,
        libraries_processed: Vec::new(),
        examined: 0,
        rated: 0,
        overwritten: 0,
        skipped: 0,
        failed: 0,
        warnings: Vec::new(),
        outcome: RunOutcome::Failure,
        error: Some(format!("Run crashed: {}", reason)),
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    engine: RatingEngine,
    settings: Arc<SettingsStore>,
    activity: ActivityLog,
    shutdown_token: CancellationToken,
) -> (RunScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let gate = RunGate::new();
    let shared_state = Arc::new(RwLock::new(SharedRunState::default()));

    let scheduler = RunScheduler::new(
        engine,
        settings,
        activity,
        gate.clone(),
        Arc::clone(&shared_state),
        command_rx,
        shutdown_token,
    );
    let handle = SchedulerHandle::new(command_tx, shared_state, gate);

    (scheduler, handle)
}
