use super::gate::{ActiveRun, RunGate};
use crate::rating::{RunKind, RunSummary, RunTrigger};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Number of finished runs kept for the status endpoint.
pub const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Run #{0} is already in progress")]
    Busy(u64),

    #[error("Scheduler not available")]
    Unavailable,
}

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    Trigger {
        kind: RunKind,
        trigger: RunTrigger,
        response: oneshot::Sender<Result<u64, TriggerError>>,
    },
    /// Re-reads the interval from the settings store and re-arms the
    /// periodic timer if it changed.
    Reschedule,
}

/// Shared state between scheduler and handle.
#[derive(Default)]
pub struct SharedRunState {
    /// Finished runs, newest first.
    pub history: VecDeque<RunSummary>,
    pub interval_minutes: u64,
    pub next_tick_at: Option<String>,
}

impl SharedRunState {
    pub fn record(&mut self, summary: RunSummary) {
        self.history.push_front(summary);
        self.history.truncate(HISTORY_LIMIT);
    }
}

/// Snapshot served by the runs endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub state: &'static str,
    pub active: Option<ActiveRun>,
    pub interval_minutes: u64,
    pub next_scheduled_at: Option<String>,
    pub history: Vec<RunSummary>,
}

/// Handle to interact with the scheduler from HTTP handlers.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedRunState>>,
    gate: RunGate,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedRunState>>,
        gate: RunGate,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
            gate,
        }
    }

    /// Asks the scheduler to start a run. Returns the run id, never queues.
    pub async fn trigger(&self, kind: RunKind, trigger: RunTrigger) -> Result<u64, TriggerError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::Trigger {
                kind,
                trigger,
                response: response_tx,
            })
            .await
            .map_err(|_| TriggerError::Unavailable)?;

        response_rx.await.map_err(|_| TriggerError::Unavailable)?
    }

    pub async fn trigger_full_run(&self, trigger: RunTrigger) -> Result<u64, TriggerError> {
        self.trigger(RunKind::full(), trigger).await
    }

    pub async fn trigger_last_batch(
        &self,
        library: Option<String>,
        trigger: RunTrigger,
    ) -> Result<u64, TriggerError> {
        self.trigger(RunKind::last_batch(library), trigger).await
    }

    pub async fn reset_ratings(&self) -> Result<u64, TriggerError> {
        self.trigger(RunKind::Reset, RunTrigger::Manual).await
    }

    pub async fn reschedule(&self) -> Result<(), TriggerError> {
        self.command_tx
            .send(SchedulerCommand::Reschedule)
            .await
            .map_err(|_| TriggerError::Unavailable)
    }

    pub fn active_run(&self) -> Option<ActiveRun> {
        self.gate.current()
    }

    pub fn is_idle(&self) -> bool {
        self.gate.is_idle()
    }

    pub async fn find_run(&self, run_id: u64) -> Option<RunSummary> {
        let state = self.shared_state.read().await;
        state.history.iter().find(|s| s.run_id == run_id).cloned()
    }

    pub async fn status(&self) -> RunStatus {
        let active = self.gate.current();
        let state = self.shared_state.read().await;
        RunStatus {
            state: if active.is_some() { "running" } else { "idle" },
            active,
            interval_minutes: state.interval_minutes,
            next_scheduled_at: state.next_tick_at.clone(),
            history: state.history.iter().cloned().collect(),
        }
    }
}
