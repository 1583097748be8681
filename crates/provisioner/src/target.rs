//! Target resolution.
//!
//! Turns a logical target name into a connection descriptor. Credentials are
//! resolved on every call so that rotated keys are picked up by the next run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Address keyword for targets that run on the orchestrator host itself.
pub const LOCAL_ADDRESS: &str = "local";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Role a target plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetRole {
    /// Runs the cluster control plane (and workloads on a single node).
    #[default]
    ControlPlane,
    /// Runs workloads only.
    Worker,
}

impl std::fmt::Display for TargetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Where the credentials for a target come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Private key file (`~` is expanded).
    SshKey { path: String },
    /// Environment variable holding the private key path.
    Env { var: String },
    /// Keys held by the running SSH agent.
    Agent,
    /// No credential (local targets).
    None,
}

/// Target as declared in the run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Logical name used on the command line and in state files.
    pub name: String,
    /// Hostname or IP address, or `local`.
    pub address: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Remote login user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Cluster role.
    #[serde(default)]
    pub role: TargetRole,
    /// Credential reference.
    pub credential: CredentialRef,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_user() -> String {
    "root".to_string()
}

/// SSH endpoint with resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key file, or `None` to rely on the agent.
    pub identity: Option<PathBuf>,
}

impl std::fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// How actions reach the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Run on the orchestrator host.
    Local,
    /// Run over SSH.
    Ssh(SshEndpoint),
}

/// A target ready to receive actions. Immutable for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Logical name.
    pub name: String,
    /// Cluster role.
    pub role: TargetRole,
    /// Connection descriptor.
    pub connection: Connection,
}

impl ResolvedTarget {
    /// Host other machines should use to reach this target.
    #[must_use]
    pub fn host(&self) -> &str {
        match &self.connection {
            Connection::Local => "127.0.0.1",
            Connection::Ssh(ep) => &ep.host,
        }
    }

    /// Stable identity used in idempotency keys.
    #[must_use]
    pub fn identity(&self) -> String {
        match &self.connection {
            Connection::Local => format!("{}@local", self.name),
            Connection::Ssh(ep) => format!("{}@{ep}", self.name),
        }
    }
}

/// Resolves target names against the declared targets.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    specs: Vec<TargetSpec>,
}

impl TargetResolver {
    /// Create a resolver over the declared targets.
    #[must_use]
    pub fn new(specs: &[TargetSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
        }
    }

    /// Names of all declared targets, in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Resolve a target by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotFound`] for unknown names and
    /// [`Error::Resolution`] if the descriptor is malformed or its
    /// credential cannot be found.
    pub fn resolve(&self, name: &str) -> Result<ResolvedTarget> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::TargetNotFound(name.to_string()))?;

        let fail = |reason: String| Error::Resolution {
            target: name.to_string(),
            reason,
        };

        let address = spec.address.trim();
        if address.is_empty() {
            return Err(fail("address is empty".into()));
        }

        if address == LOCAL_ADDRESS {
            debug!(target = %name, "Resolved local target");
            return Ok(ResolvedTarget {
                name: spec.name.clone(),
                role: spec.role,
                connection: Connection::Local,
            });
        }

        if address.chars().any(char::is_whitespace) {
            return Err(fail(format!("invalid address '{address}'")));
        }
        if spec.port == 0 {
            return Err(fail("port must be non-zero".into()));
        }
        if spec.user.trim().is_empty() {
            return Err(fail("user is empty".into()));
        }

        let identity = match &spec.credential {
            CredentialRef::SshKey { path } => Some(existing_key(&expand_home(path)).map_err(fail)?),
            CredentialRef::Env { var } => {
                let value = std::env::var(var)
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| fail(format!("credential variable {var} is not set")))?;
                Some(existing_key(&expand_home(value.trim())).map_err(fail)?)
            }
            CredentialRef::Agent => None,
            CredentialRef::None => {
                return Err(fail("remote targets need a credential".into()));
            }
        };

        let endpoint = SshEndpoint {
            host: address.to_string(),
            port: spec.port,
            user: spec.user.clone(),
            identity,
        };
        debug!(target = %name, endpoint = %endpoint, "Resolved target");

        Ok(ResolvedTarget {
            name: spec.name.clone(),
            role: spec.role,
            connection: Connection::Ssh(endpoint),
        })
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn existing_key(path: &Path) -> std::result::Result<PathBuf, String> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(format!("key file {} does not exist", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn spec(name: &str, address: &str, credential: CredentialRef) -> TargetSpec {
        TargetSpec {
            name: name.into(),
            address: address.into(),
            port: DEFAULT_SSH_PORT,
            user: "root".into(),
            role: TargetRole::ControlPlane,
            credential,
        }
    }

    #[test]
    fn test_unknown_target() {
        let resolver = TargetResolver::new(&[]);
        assert!(matches!(
            resolver.resolve("nope"),
            Err(Error::TargetNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_local_target() {
        let resolver = TargetResolver::new(&[spec("box", "local", CredentialRef::None)]);
        let target = resolver.resolve("box").unwrap();
        assert_eq!(target.connection, Connection::Local);
        assert_eq!(target.host(), "127.0.0.1");
    }

    #[test]
    fn test_agent_target() {
        let resolver = TargetResolver::new(&[spec("gpu", "10.0.0.5", CredentialRef::Agent)]);
        let target = resolver.resolve("gpu").unwrap();
        match target.connection {
            Connection::Ssh(ref ep) => {
                assert_eq!(ep.to_string(), "root@10.0.0.5:22");
                assert!(ep.identity.is_none());
            }
            Connection::Local => panic!("expected ssh"),
        }
        assert_eq!(target.identity(), "gpu@root@10.0.0.5:22");
    }

    #[test]
    fn test_malformed_descriptors() {
        let mut zero_port = spec("a", "10.0.0.5", CredentialRef::Agent);
        zero_port.port = 0;
        let resolver = TargetResolver::new(&[
            zero_port,
            spec("b", "", CredentialRef::Agent),
            spec("c", "10.0.0.5", CredentialRef::None),
            spec(
                "d",
                "10.0.0.5",
                CredentialRef::SshKey {
                    path: "/definitely/missing/key".into(),
                },
            ),
        ]);

        for name in ["a", "b", "c", "d"] {
            assert!(
                matches!(resolver.resolve(name), Err(Error::Resolution { .. })),
                "target {name} should fail resolution"
            );
        }
    }

    #[test]
    #[serial]
    fn test_env_credential_is_read_per_resolution() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, "key").unwrap();
        std::fs::write(&second, "key").unwrap();

        let resolver = TargetResolver::new(&[spec(
            "gpu",
            "10.0.0.5",
            CredentialRef::Env {
                var: "PROVISION_TEST_KEY".into(),
            },
        )]);

        // SAFETY: serialized via #[serial]
        unsafe { std::env::set_var("PROVISION_TEST_KEY", &first) };
        let one = resolver.resolve("gpu").unwrap();

        // SAFETY: serialized via #[serial]
        unsafe { std::env::set_var("PROVISION_TEST_KEY", &second) };
        let two = resolver.resolve("gpu").unwrap();

        // SAFETY: serialized via #[serial]
        unsafe { std::env::remove_var("PROVISION_TEST_KEY") };
        let three = resolver.resolve("gpu");

        let identity = |t: &ResolvedTarget| match &t.connection {
            Connection::Ssh(ep) => ep.identity.clone(),
            Connection::Local => None,
        };
        assert_eq!(identity(&one), Some(first));
        assert_eq!(identity(&two), Some(second));
        assert!(matches!(three, Err(Error::Resolution { .. })));
    }
}
