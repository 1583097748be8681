//! Run configuration.
//!
//! A run file declares the targets, the stages to execute against them,
//! named secrets and the verification jobs. It is read once per invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::stage::{Stage, MAX_BACKOFF_SECS};
use crate::target::TargetSpec;
use crate::verify::VerificationJob;

/// Default run file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "provision.yaml";

/// Default state directory (relative to the run file).
pub const DEFAULT_STATE_DIR: &str = ".provision";

/// A named secret, read from the environment when a stage needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Environment variable holding the secret value.
    pub env: String,
}

/// Full run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory for execution records, logs and fetched artifacts.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Logical targets.
    pub targets: Vec<TargetSpec>,
    /// Named secrets available to bootstrap stages.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretSpec>,
    /// Stage definitions in declaration order.
    pub stages: Vec<Stage>,
    /// Verification jobs.
    #[serde(default)]
    pub verification: Vec<VerificationJob>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl RunConfig {
    /// Load and validate a run file.
    ///
    /// A relative `state_dir` is resolved against the run file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        if config.state_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.state_dir = base.join(&config.state_dir);
        }

        debug!(
            path = %path.display(),
            targets = config.targets.len(),
            stages = config.stages.len(),
            "Loaded run configuration"
        );
        Ok(config)
    }

    /// Parse and validate a run file from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the YAML is invalid or fails validation.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse run file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references that serde cannot express.
    ///
    /// Graph shape (unknown dependencies, cycles) is validated when the
    /// stage graph is built, not here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::Config("At least one target is required".into()));
        }

        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            if !is_plain_name(&target.name) {
                return Err(Error::Config(format!(
                    "Target name '{}' may only contain letters, digits, '.', '-' and '_'",
                    target.name
                )));
            }
            if !names.insert(target.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate target name: {}",
                    target.name
                )));
            }
        }

        for stage in &self.stages {
            if !is_plain_name(&stage.id) {
                return Err(Error::Config(format!(
                    "Stage id '{}' may only contain letters, digits, '.', '-' and '_'",
                    stage.id
                )));
            }
            if let Some(secret) = &stage.secret {
                if !self.secrets.contains_key(secret) {
                    return Err(Error::Config(format!(
                        "Stage '{}' references undefined secret '{secret}'",
                        stage.id
                    )));
                }
            }
            if stage.retry.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "Stage '{}' must allow at least one attempt",
                    stage.id
                )));
            }
            if !stage.retry.multiplier.is_finite() || stage.retry.multiplier < 1.0 {
                return Err(Error::Config(format!(
                    "Stage '{}' retry multiplier must be a finite number of at least 1",
                    stage.id
                )));
            }
            if stage.retry.max_backoff_secs > MAX_BACKOFF_SECS {
                return Err(Error::Config(format!(
                    "Stage '{}' max_backoff_secs may not exceed {MAX_BACKOFF_SECS}",
                    stage.id
                )));
            }
        }

        let mut jobs = std::collections::HashSet::new();
        for job in &self.verification {
            if !jobs.insert(job.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate verification job: {}",
                    job.name
                )));
            }
            job.validate()?;
        }

        Ok(())
    }

    /// Look up a verification job by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no job has that name.
    pub fn job(&self, name: &str) -> Result<&VerificationJob> {
        self.verification
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| Error::Config(format!("Unknown verification job: {name}")))
    }

    /// Name of the only target, or of the first target declared.
    #[must_use]
    pub fn default_target(&self) -> Option<&str> {
        self.targets.first().map(|t| t.name.as_str())
    }

    /// Directory where fetched artifacts are written.
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    /// Default local path for an artifact fetched from a target.
    #[must_use]
    pub fn artifact_path(&self, target: &str, artifact: &str) -> PathBuf {
        self.artifacts_dir().join(target).join(artifact)
    }
}

/// Names used as file names under the state directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
targets:
  - name: gpu-node
    address: 10.0.0.5
    user: root
    role: control-plane
    credential: { kind: agent }
secrets:
  gitops-token: { env: GITHUB_TOKEN }
stages:
  - id: k3s
    run: "curl -sfL https://get.k3s.io | sh -"
    teardown: /usr/local/bin/k3s-uninstall.sh
    artifacts: { kubeconfig: /etc/rancher/k3s/k3s.yaml }
  - id: flux
    run: flux bootstrap github --owner=me --repository=cluster
    depends_on: [k3s]
    secret: gitops-token
verification:
  - name: gpu-pair
    parallelism: 2
    image: nvcr.io/nvidia/k8s/cuda-sample:vectoradd-cuda12.5.0
    success_marker: Test PASSED
"#;

    #[test]
    fn test_parse_sample() {
        let config = RunConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.state_dir, PathBuf::from(".provision"));
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[1].depends_on, vec!["k3s".to_string()]);
        assert_eq!(config.default_target(), Some("gpu-node"));

        let job = config.job("gpu-pair").unwrap();
        assert_eq!(job.parallelism, 2);
        assert_eq!(job.devices_per_unit, 1);
        assert!(config.job("missing").is_err());
    }

    #[test]
    fn test_undefined_secret_rejected() {
        let yaml = SAMPLE.replace("secret: gitops-token", "secret: nope");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("undefined secret"));
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let yaml = r#"
targets:
  - { name: a, address: local, credential: { kind: none } }
  - { name: a, address: local, credential: { kind: none } }
stages: []
"#;
        let err = RunConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate target"));
    }

    #[test]
    fn test_unsafe_names_rejected() {
        for name in ["gpu node", "..", "a/b", ""] {
            let yaml = format!(
                "targets:\n  - {{ name: \"{name}\", address: local, credential: {{ kind: none }} }}\nstages: []\n"
            );
            let err = RunConfig::from_yaml(&yaml).unwrap_err();
            assert!(err.to_string().contains("Target name"), "{name:?} accepted");
        }

        let yaml = SAMPLE.replace("id: flux", "id: flux/bootstrap");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("Stage id"));

        assert!(is_plain_name("gpu-node.lan_1"));
    }

    #[test]
    fn test_unbounded_backoff_rejected() {
        let yaml = SAMPLE.replace(
            "secret: gitops-token",
            "secret: gitops-token\n    retry: { max_backoff_secs: 18446744073709551615 }",
        );
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_backoff_secs"));

        let yaml = SAMPLE.replace(
            "secret: gitops-token",
            "secret: gitops-token\n    retry: { multiplier: 0.5 }",
        );
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("multiplier"));
    }

    #[test]
    fn test_relative_state_dir_follows_run_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("provision.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.state_dir, dir.path().join(".provision"));
        assert_eq!(
            config.artifact_path("gpu-node", "kubeconfig"),
            dir.path().join(".provision/artifacts/gpu-node/kubeconfig")
        );
    }
}
