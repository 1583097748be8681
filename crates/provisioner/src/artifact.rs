//! Fetching artifacts produced by stages.
//!
//! Some stages leave behind files the operator needs locally, most notably
//! the cluster access descriptor written by the Kubernetes install. This
//! module copies such a file from the target into the state directory.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::error::{Error, Result};
use crate::graph::StageGraph;
use crate::runner::{shell_quote, Action, ActionRunner};
use crate::stage::Stage;
use crate::state::StateStore;
use crate::target::ResolvedTarget;

/// Timeout for reading an artifact on the target.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

static LOOPBACK_SERVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\s*server:\s*https?://)(?:127\.0\.0\.1|localhost|\[::1\])(:\d+)?")
        .expect("loopback server pattern is valid")
});

/// Options for [`fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Local destination; `<state_dir>/artifacts/<target>/<name>` when absent.
    pub dest: Option<PathBuf>,
    /// Point loopback `server:` entries at the target's address.
    pub rewrite_server: bool,
}

/// Stage that declares `artifact`.
///
/// # Errors
///
/// Returns [`Error::Config`] if no stage declares it.
pub fn producer<'a>(graph: &'a StageGraph, artifact: &str) -> Result<&'a Stage> {
    graph
        .install_order()
        .into_iter()
        .find(|s| s.artifacts.contains_key(artifact))
        .ok_or_else(|| Error::Config(format!("No stage declares artifact '{artifact}'")))
}

/// Replace loopback API server addresses with `host`.
#[must_use]
pub fn rewrite_loopback(content: &str, host: &str) -> String {
    LOOPBACK_SERVER
        .replace_all(content, |caps: &regex::Captures<'_>| {
            format!(
                "{}{host}{}",
                &caps[1],
                caps.get(2).map_or("", |m| m.as_str())
            )
        })
        .into_owned()
}

/// Copy `artifact` from `target` to a local file and return its path.
///
/// The producing stage must have succeeded on the target.
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown artifacts and [`Error::Artifact`]
/// if the producing stage has not succeeded or the file cannot be read or
/// written.
pub async fn fetch(
    store: &StateStore,
    runner: &dyn ActionRunner,
    graph: &StageGraph,
    target: &ResolvedTarget,
    artifact: &str,
    default_dest: &Path,
    options: &FetchOptions,
) -> Result<PathBuf> {
    let stage = producer(graph, artifact)?;
    let status = store.get(&target.name, &stage.id)?.map(|r| r.status);
    if !status.is_some_and(|s| s.is_satisfied()) {
        return Err(Error::Artifact(format!(
            "stage '{}' has not succeeded on '{}' (status: {})",
            stage.id,
            target.name,
            status.map_or_else(|| "pending".to_string(), |s| s.to_string())
        )));
    }

    let remote = stage
        .artifacts
        .get(artifact)
        .ok_or_else(|| Error::Config(format!("No stage declares artifact '{artifact}'")))?;
    let action = Action::script(format!("cat -- {}", shell_quote(remote)), FETCH_TIMEOUT);

    let output = tokio::time::timeout(FETCH_TIMEOUT, runner.run(target, &action))
        .await
        .map_err(|_| Error::Artifact(format!("timed out reading {remote} on '{}'", target.name)))?
        .map_err(|e| Error::Artifact(format!("failed to read {remote} on '{}': {e}", target.name)))?;
    if output.exit_code != 0 {
        return Err(Error::Artifact(format!(
            "reading {remote} on '{}' exited with {}: {}",
            target.name,
            output.exit_code,
            output.stderr.trim()
        )));
    }

    let content = if options.rewrite_server {
        rewrite_loopback(&output.stdout, target.host())
    } else {
        output.stdout
    };

    let dest = options.dest.clone().unwrap_or_else(|| default_dest.to_path_buf());
    write_private(&dest, &content)?;

    info!(
        target = %target.name,
        artifact,
        dest = %dest.display(),
        "Fetched artifact"
    );
    Ok(dest)
}

/// Write `content` readable by the owner only.
fn write_private(path: &Path, content: &str) -> Result<()> {
    let io_err = |e: std::io::Error| Error::Artifact(format!("failed to write {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, content).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const K3S_YAML: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Zm9v
    server: https://127.0.0.1:6443
  name: default
";

    #[test]
    fn test_rewrite_loopback() {
        let rewritten = rewrite_loopback(K3S_YAML, "192.168.0.176");
        assert!(rewritten.contains("    server: https://192.168.0.176:6443\n"));
        assert!(rewritten.contains("certificate-authority-data: Zm9v"));

        let localhost = "    server: https://localhost:6443";
        assert_eq!(
            rewrite_loopback(localhost, "gpu.lan"),
            "    server: https://gpu.lan:6443"
        );
    }

    #[test]
    fn test_rewrite_leaves_remote_servers() {
        let remote = "    server: https://10.1.2.3:6443";
        assert_eq!(rewrite_loopback(remote, "gpu.lan"), remote);
    }

    #[test]
    fn test_write_private() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("artifacts/node/kubeconfig");
        write_private(&path, "data").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
