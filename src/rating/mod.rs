//! Batch rating of Plex tracks and the reset operation.

mod engine;
mod models;
mod retry_policy;

pub use engine::{EngineOptions, RatingEngine, RunContext, DEFAULT_CONCURRENCY};
pub use models::{RunKind, RunOutcome, RunScope, RunSummary, RunTrigger};
pub use retry_policy::RetryPolicy;
