//! Action transport.
//!
//! An [`ActionRunner`] carries a shell script to a resolved target and brings
//! back its exit status and output. The production runner pipes the script
//! into `sh -s`, either locally or through `ssh`, so parameters and secrets
//! travel over stdin and never appear on a command line.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ActionError;
use crate::target::{Connection, ResolvedTarget, SshEndpoint};

/// SSH exits with this status when the failure is in SSH itself.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Seconds SSH may spend establishing a connection.
const SSH_CONNECT_TIMEOUT_SECS: u64 = 15;

/// A secret passed through to one action.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    /// Environment variable name exposed to the script.
    pub env: String,
    /// Secret value.
    pub value: String,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("env", &self.env)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// One invocation of a shell script on a target.
#[derive(Debug, Clone)]
pub struct Action {
    /// Script body.
    pub script: String,
    /// Variables exported before the script runs.
    pub env: BTreeMap<String, String>,
    /// Secret exported before the script runs.
    pub secret: Option<Secret>,
    /// Attempt timeout, enforced by the caller.
    pub timeout: Duration,
}

impl Action {
    /// An action with no environment.
    #[must_use]
    pub fn script(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            env: BTreeMap::new(),
            secret: None,
            timeout,
        }
    }

    /// Full text piped into the remote shell.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::MalformedAction`] for an empty script or an
    /// invalid variable name.
    pub fn render(&self) -> Result<String, ActionError> {
        if self.script.trim().is_empty() {
            return Err(ActionError::MalformedAction("script is empty".into()));
        }

        let mut text = String::new();
        for (key, value) in &self.env {
            text.push_str(&export_line(key, value)?);
        }
        if let Some(secret) = &self.secret {
            text.push_str(&export_line(&secret.env, &secret.value)?);
        }
        text.push_str(&self.script);
        if !self.script.ends_with('\n') {
            text.push('\n');
        }
        Ok(text)
    }
}

fn export_line(key: &str, value: &str) -> Result<String, ActionError> {
    let valid = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ActionError::MalformedAction(format!(
            "invalid variable name '{key}'"
        )));
    }
    Ok(format!("export {key}={}\n", shell_quote(value)))
}

/// Quote a value for POSIX `sh`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Result of a script that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Exit code (`-1` when terminated by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ActionOutput {
    /// Output of a successful run.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Output of a run that exited with `code`.
    #[must_use]
    pub fn exited(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Both streams, for the captured log.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("--- stderr ---\n");
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Runs actions against targets.
///
/// Implementations return `Ok` whenever the script itself ran, whatever its
/// exit code, and `Err` only for transport-level failures. Timeouts and
/// cancellation are enforced by the caller by dropping the future, so
/// implementations must release their resources on drop.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run `action` on `target`.
    async fn run(&self, target: &ResolvedTarget, action: &Action)
        -> Result<ActionOutput, ActionError>;
}

/// Runs scripts through `sh -s`, locally or over SSH.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    /// Create a shell runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(connection: &Connection) -> Command {
        match connection {
            Connection::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-s");
                cmd
            }
            Connection::Ssh(ep) => {
                let mut cmd = Command::new("ssh");
                cmd.args(ssh_args(ep));
                cmd
            }
        }
    }
}

/// Arguments for `ssh` that run `sh -s` on the endpoint.
#[must_use]
pub fn ssh_args(ep: &SshEndpoint) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-p".to_string(),
        ep.port.to_string(),
    ];
    if let Some(identity) = &ep.identity {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", ep.user, ep.host));
    args.push("sh -s".to_string());
    args
}

/// Classify an SSH-level failure from its stderr.
#[must_use]
pub fn classify_ssh_failure(stderr: &str) -> ActionError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
    {
        ActionError::Authentication(message)
    } else {
        ActionError::Connection(message)
    }
}

#[async_trait]
impl ActionRunner for ShellRunner {
    async fn run(
        &self,
        target: &ResolvedTarget,
        action: &Action,
    ) -> Result<ActionOutput, ActionError> {
        let text = action.render()?;
        debug!(target = %target.name, bytes = text.len(), "Running action");

        let mut child = Self::command(&target.connection)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ActionError::MalformedAction(format!("transport binary not found: {e}"))
                }
                _ => ActionError::Connection(format!("failed to spawn transport: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| ActionError::Connection(format!("failed to send script: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ActionError::Connection(format!("failed to collect output: {e}")))?;

        let result = ActionOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if matches!(target.connection, Connection::Ssh(_))
            && result.exit_code == SSH_TRANSPORT_FAILURE
        {
            return Err(classify_ssh_failure(&result.stderr));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetRole;
    use std::path::PathBuf;

    fn local() -> ResolvedTarget {
        ResolvedTarget {
            name: "local".into(),
            role: TargetRole::ControlPlane,
            connection: Connection::Local,
        }
    }

    #[test]
    fn test_render_exports_params_and_secret() {
        let mut action = Action::script("flux bootstrap", Duration::from_secs(5));
        action.env.insert("OWNER".into(), "it's me".into());
        action.secret = Some(Secret {
            env: "GITHUB_TOKEN".into(),
            value: "s3cr3t".into(),
        });

        let text = action.render().unwrap();
        assert_eq!(
            text,
            "export OWNER='it'\\''s me'\nexport GITHUB_TOKEN='s3cr3t'\nflux bootstrap\n"
        );
        assert!(!format!("{action:?}").contains("s3cr3t"));
    }

    #[test]
    fn test_render_rejects_bad_input() {
        let empty = Action::script("  ", Duration::from_secs(1));
        assert!(matches!(empty.render(), Err(ActionError::MalformedAction(_))));

        let mut bad_key = Action::script("true", Duration::from_secs(1));
        bad_key.env.insert("1BAD".into(), "x".into());
        assert!(matches!(bad_key.render(), Err(ActionError::MalformedAction(_))));
    }

    #[test]
    fn test_ssh_args() {
        let ep = SshEndpoint {
            host: "10.0.0.5".into(),
            port: 2222,
            user: "core".into(),
            identity: Some(PathBuf::from("/keys/id")),
        };
        let args = ssh_args(&ep);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert_eq!(args[args.len() - 2], "core@10.0.0.5");
        assert_eq!(args[args.len() - 1], "sh -s");
    }

    #[test]
    fn test_classify_ssh_failure() {
        assert!(matches!(
            classify_ssh_failure("root@10.0.0.5: Permission denied (publickey)."),
            ActionError::Authentication(_)
        ));
        assert!(matches!(
            classify_ssh_failure("ssh: connect to host 10.0.0.5 port 22: Connection refused"),
            ActionError::Connection(_)
        ));
    }

    #[test]
    fn test_combined_output() {
        let out = ActionOutput {
            exit_code: 1,
            stdout: "line".into(),
            stderr: "oops".into(),
        };
        assert_eq!(out.combined(), "line\n--- stderr ---\noops");
    }

    #[tokio::test]
    async fn test_local_runner_captures_output() {
        let mut action = Action::script("echo \"hello $NAME\"; exit 3", Duration::from_secs(10));
        action.env.insert("NAME".into(), "gpu".into());

        let out = ShellRunner::new().run(&local(), &action).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello gpu");
    }
}
