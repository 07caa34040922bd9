use serde::Serialize;
use std::fmt;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
    Webhook,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Webhook => "webhook",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tracks a rating run looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RunScope {
    /// Every configured library, unrated tracks only unless overriding.
    Full,
    /// The most recently added tracks, optionally of a single library.
    LastBatch { library: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunKind {
    Rate {
        #[serde(flatten)]
        scope: RunScope,
    },
    Reset,
}

impl RunKind {
    pub fn full() -> Self {
        RunKind::Rate {
            scope: RunScope::Full,
        }
    }

    pub fn last_batch(library: Option<String>) -> Self {
        RunKind::Rate {
            scope: RunScope::LastBatch { library },
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RunKind::Rate {
                scope: RunScope::Full,
            } => "full",
            RunKind::Rate {
                scope: RunScope::LastBatch { .. },
            } => "last_batch",
            RunKind::Reset => "reset",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Rate {
                scope: RunScope::Full,
            } => write!(f, "full rating"),
            RunKind::Rate {
                scope: RunScope::LastBatch { library: None },
            } => write!(f, "last batch rating"),
            RunKind::Rate {
                scope: RunScope::LastBatch {
                    library: Some(library),
                },
            } => write!(f, "last batch rating of '{}'", library),
            RunKind::Reset => write!(f, "ratings reset"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialFailure => "partial_failure",
            RunOutcome::Failure => "failure",
        }
    }
}

/// Counters and outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: u64,
    #[serde(flatten)]
    pub kind: RunKind,
    pub trigger: RunTrigger,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub libraries_processed: Vec<String>,
    pub examined: usize,
    /// Tracks written: rated, or cleared for a reset.
    pub rated: usize,
    /// Subset of `rated` that replaced an existing rating.
    pub overwritten: usize,
    pub skipped: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}
