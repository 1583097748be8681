//! Run reports.
//!
//! A report lists every planned stage with its outcome, so a caller can tell
//! what ran, what was skipped, what failed and what never got a chance.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{EXIT_ABORTED, EXIT_OK, EXIT_STAGE_FAILURE};

/// Which traversal produced the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Forward install order.
    Install,
    /// Reverse teardown order.
    Uninstall,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The action ran and succeeded.
    Succeeded { attempts: u32 },
    /// A prior success with the same idempotency key was re-confirmed.
    Skipped,
    /// The action failed.
    Failed {
        attempts: u32,
        error: String,
        output: Option<PathBuf>,
    },
    /// A dependency (or, on teardown, a dependent) failed or was blocked.
    Blocked { by: String },
    /// Not launched because the run halted (fail-fast or abort).
    NotAttempted,
    /// Teardown action ran and the record was removed.
    Removed { attempts: u32 },
    /// No teardown action; the record was cleared.
    Cleared,
    /// Nothing recorded for this stage; nothing to tear down.
    Absent,
}

impl StageOutcome {
    /// Whether the outcome invoked the stage's action.
    #[must_use]
    pub fn ran_action(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Removed { .. }
        )
    }

    /// Short label for console output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::NotAttempted => "not attempted",
            Self::Removed { .. } => "removed",
            Self::Cleared => "cleared",
            Self::Absent => "absent",
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Stage id.
    pub stage: String,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Result of an install or uninstall run on one target.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Target name.
    pub target: String,
    /// Traversal direction.
    pub operation: Operation,
    /// Stage outcomes in traversal order.
    pub stages: Vec<StageReport>,
    /// Whether the run was aborted by the caller.
    pub aborted: bool,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    /// Start a report.
    #[must_use]
    pub fn new(target: impl Into<String>, operation: Operation) -> Self {
        Self {
            target: target.into(),
            operation,
            stages: Vec::new(),
            aborted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record a stage outcome.
    pub fn push(&mut self, stage: impl Into<String>, outcome: StageOutcome) {
        self.stages.push(StageReport {
            stage: stage.into(),
            outcome,
        });
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Outcome of a stage, if it was planned.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.outcome)
    }

    /// Stages that failed.
    #[must_use]
    pub fn failures(&self) -> Vec<&StageReport> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed { .. }))
            .collect()
    }

    /// Stages blocked by a failure.
    #[must_use]
    pub fn blocked(&self) -> Vec<&StageReport> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Blocked { .. }))
            .collect()
    }

    /// Stages never launched.
    #[must_use]
    pub fn not_attempted(&self) -> Vec<&StageReport> {
        self.stages
            .iter()
            .filter(|s| s.outcome == StageOutcome::NotAttempted)
            .collect()
    }

    /// Number of stages whose action was invoked.
    #[must_use]
    pub fn actions_taken(&self) -> usize {
        self.stages.iter().filter(|s| s.outcome.ran_action()).count()
    }

    /// Whether every planned stage reached a good outcome.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.aborted
            && self.stages.iter().all(|s| {
                !matches!(
                    s.outcome,
                    StageOutcome::Failed { .. }
                        | StageOutcome::Blocked { .. }
                        | StageOutcome::NotAttempted
                )
            })
    }

    /// Process exit code for this report.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            EXIT_ABORTED
        } else if self.is_success() {
            EXIT_OK
        } else {
            EXIT_STAGE_FAILURE
        }
    }
}
