//! Error taxonomy for provisioning and verification.
//!
//! Every failure that can end a run maps to one variant here. The binary
//! turns the variant into a process exit code with [`Error::exit_code`].

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exit code for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code when at least one stage failed or was blocked.
pub const EXIT_STAGE_FAILURE: i32 = 1;
/// Exit code for bad invocations, configuration and malformed graphs.
pub const EXIT_USAGE: i32 = 2;
/// Exit code when verification did not certify every unit.
pub const EXIT_VERIFICATION: i32 = 3;
/// Exit code after a caller-triggered abort.
pub const EXIT_ABORTED: i32 = 130;

/// Errors that can occur while provisioning or verifying a target.
#[derive(Error, Debug)]
pub enum Error {
    /// No target with this name exists in the configuration.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// The target exists but its descriptor cannot be turned into a connection.
    #[error("Cannot resolve target '{target}': {reason}")]
    Resolution { target: String, reason: String },

    /// Two stages share an identifier.
    #[error("Duplicate stage id: {0}")]
    DuplicateStage(String),

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A stage depends on an id that is not defined.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    /// A stage was attempted before its prerequisites succeeded.
    #[error("Stage '{stage}' on '{target}' requires '{dependency}' (status: {status})")]
    DependencyNotSatisfied {
        target: String,
        stage: String,
        dependency: String,
        status: String,
    },

    /// A stage action failed after the retry budget was spent (or fatally).
    #[error("Stage '{stage}' failed on '{target}' after {attempts} attempt(s): {source}")]
    StageFailed {
        target: String,
        stage: String,
        attempts: u32,
        output: Option<PathBuf>,
        #[source]
        source: ActionError,
    },

    /// A terminal verification unit completed without the success marker.
    #[error("Verification '{job}' mismatch: no unit emitted '{marker}' ({failed} of {total} units)")]
    VerificationMismatch {
        job: String,
        marker: String,
        failed: usize,
        total: usize,
    },

    /// Some verification units passed and others did not.
    #[error("Verification '{job}' partially failed: {passed} of {total} units passed; failing: {}", .failing.join(", "))]
    PartialParallelFailure {
        job: String,
        passed: usize,
        total: usize,
        failing: Vec<String>,
    },

    /// No verification unit passed, and not every failure was a missing marker.
    #[error("Verification '{job}' failed: none of {total} units passed; failing: {}", .failing.join(", "))]
    VerificationFailed {
        job: String,
        total: usize,
        failing: Vec<String>,
    },

    /// The run was aborted by the caller.
    #[error("Run aborted")]
    Cancelled,

    /// Run file is unreadable or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State directory could not be read or written.
    #[error("State store error at {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State file exists but cannot be parsed.
    #[error("Corrupt state file {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// Artifact could not be fetched from a target.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Kubernetes API failure while verifying.
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// A background task died unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map the error to the process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StageFailed { .. } | Self::DependencyNotSatisfied { .. } => EXIT_STAGE_FAILURE,
            Self::VerificationMismatch { .. }
            | Self::PartialParallelFailure { .. }
            | Self::VerificationFailed { .. } => EXIT_VERIFICATION,
            Self::Cancelled => EXIT_ABORTED,
            Self::TargetNotFound(_)
            | Self::Resolution { .. }
            | Self::DuplicateStage(_)
            | Self::CyclicDependency { .. }
            | Self::UnknownDependency { .. }
            | Self::Config(_) => EXIT_USAGE,
            Self::State { .. }
            | Self::CorruptState { .. }
            | Self::Artifact(_)
            | Self::Cluster(_)
            | Self::Internal(_) => EXIT_STAGE_FAILURE,
        }
    }
}

/// Failure of a single action attempt, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transport to the target was lost or never established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The attempt exceeded the stage timeout.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// The target rejected our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The action cannot be run at all (missing binary, empty script, bad secret).
    #[error("Malformed action: {0}")]
    MalformedAction(String),

    /// The action ran and exited non-zero.
    #[error("Command exited with status {code}: {stderr}")]
    CommandFailure { code: i32, stderr: String },

    /// The run was aborted while the action was in flight.
    #[error("Aborted while running")]
    Cancelled,
}

impl ActionError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Short label stored as the record's last exit signal.
    #[must_use]
    pub fn signal(&self) -> String {
        match self {
            Self::Connection(_) => "connection-error".to_string(),
            Self::Timeout(_) => "timeout".to_string(),
            Self::Authentication(_) => "authentication-error".to_string(),
            Self::MalformedAction(_) => "malformed-action".to_string(),
            Self::CommandFailure { code, .. } => format!("exit:{code}"),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}
