use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::rating::{RunKind, RunTrigger};
use crate::server::metrics;

/// The run currently holding the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRun {
    pub run_id: u64,
    #[serde(flatten)]
    pub kind: RunKind,
    pub trigger: RunTrigger,
    pub started_at: String,
}

/// Single slot admitting at most one run at a time.
///
/// Acquiring never waits: a second caller gets the id of the run in
/// progress. The slot is released when the returned permit is dropped, which
/// also happens when the task owning it panics.
#[derive(Clone, Default)]
pub struct RunGate {
    slot: Arc<Mutex<Option<ActiveRun>>>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the slot for `run`, or returns the id of the active run.
    pub fn try_acquire(&self, run: ActiveRun) -> Result<RunPermit, u64> {
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref() {
            return Err(active.run_id);
        }
        let run_id = run.run_id;
        *slot = Some(run);
        metrics::set_run_active(true);
        Ok(RunPermit {
            slot: Arc::clone(&self.slot),
            run_id,
        })
    }

    pub fn current(&self) -> Option<ActiveRun> {
        self.slot().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.slot().is_none()
    }
}

#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct RunPermit {
    slot: Arc<Mutex<Option<ActiveRun>>>,
    run_id: u64,
}

impl RunPermit {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|r| r.run_id) == Some(self.run_id) {
            *slot = None;
        }
        metrics::set_run_active(false);
    }
}
