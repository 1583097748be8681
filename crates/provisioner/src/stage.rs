//! Stage definitions.
//!
//! A stage is one named, idempotent unit of provisioning work with declared
//! dependencies. Stages are immutable for the duration of a run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::target::ResolvedTarget;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Largest backoff delay a run file may ask for.
pub const MAX_BACKOFF_SECS: u64 = 86_400;

/// Retry policy for retryable action failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_secs: u64,
    /// Upper bound for any single delay.
    pub max_backoff_secs: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 120,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1).min(16)).unwrap_or(16);
        #[allow(clippy::cast_precision_loss)]
        let delay_secs = self.initial_backoff_secs as f64 * self.multiplier.powi(exp);
        #[allow(clippy::cast_precision_loss)]
        let capped = delay_secs.min(self.max_backoff_secs as f64).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::from_secs(self.max_backoff_secs))
    }

    /// Whether another attempt is allowed after `attempts` attempts.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A stage as declared in the run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Unique identifier.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Shell script executed on the target during install.
    pub run: String,
    /// Shell script executed on the target during uninstall.
    #[serde(default)]
    pub teardown: Option<String>,
    /// Stages that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Parameters exported to the script environment.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Name of the secret injected into this stage's action.
    #[serde(default)]
    pub secret: Option<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retry policy for retryable failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Non-zero exit codes treated as success.
    #[serde(default)]
    pub tolerated_exit_codes: Vec<i32>,
    /// Files produced on the target, by artifact name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Stage {
    /// Create a stage with defaults for everything but id and script.
    #[must_use]
    pub fn new(id: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            run: run.into(),
            teardown: None,
            depends_on: Vec::new(),
            params: BTreeMap::new(),
            secret: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            tolerated_exit_codes: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Add a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Set the teardown script.
    #[must_use]
    pub fn with_teardown(mut self, script: impl Into<String>) -> Self {
        self.teardown = Some(script.into());
        self
    }

    /// Set a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether an exit code counts as success for this stage.
    #[must_use]
    pub fn tolerates(&self, code: i32) -> bool {
        code == 0 || self.tolerated_exit_codes.contains(&code)
    }

    /// Display label.
    #[must_use]
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.id)
    }

    /// Idempotency key for running this stage against `target`.
    ///
    /// Covers the script, parameters, secret name (never its value),
    /// tolerated exit codes and target identity.
    #[must_use]
    pub fn idempotency_key(&self, target: &ResolvedTarget) -> String {
        let material = serde_json::json!({
            "stage": self.id,
            "run": self.run,
            "params": self.params,
            "secret": self.secret,
            "tolerated": self.tolerated_exit_codes,
            "target": target.identity(),
        });
        let digest = Sha256::digest(material.to_string().as_bytes());
        hex::encode(digest)
    }
}
