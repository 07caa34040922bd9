//! Run scheduling: manual, periodic and webhook triggers behind one gate.

mod gate;
mod handle;
#[allow(clippy::module_inception)]
mod scheduler;

pub use gate::{ActiveRun, RunGate, RunPermit};
pub use handle::{RunStatus, SchedulerCommand, SchedulerHandle, SharedRunState, TriggerError, HISTORY_LIMIT};
pub use scheduler::{create_scheduler, RunScheduler};
