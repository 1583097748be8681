//! Fetching stage artifacts from a target.

mod common;

use common::FakeRunner;
use provisioner::artifact::{fetch, FetchOptions};
use provisioner::runner::{shell_quote, ActionOutput};
use provisioner::target::{Connection, ResolvedTarget, SshEndpoint, TargetRole};
use provisioner::{Error, ExecutionRecord, Stage, StageGraph, StageStatus, StateStore};
use tempfile::TempDir;

const REMOTE: &str = "/etc/rancher/k3s/k3s.yaml";

const K3S_YAML: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Zm9v
    server: https://127.0.0.1:6443
  name: default
";

fn node() -> ResolvedTarget {
    ResolvedTarget {
        name: "gpu-node".into(),
        role: TargetRole::ControlPlane,
        connection: Connection::Ssh(SshEndpoint {
            host: "192.168.0.176".into(),
            port: 22,
            user: "admin".into(),
            identity: None,
        }),
    }
}

fn graph() -> StageGraph {
    let mut k3s = Stage::new("k3s", "install-k3s");
    k3s.artifacts.insert("kubeconfig".into(), REMOTE.into());
    StageGraph::build(vec![Stage::new("os-prep", "prep"), k3s.depends_on("os-prep")]).unwrap()
}

fn cat_script() -> String {
    format!("cat -- {}", shell_quote(REMOTE))
}

fn mark(store: &StateStore, target: &str, stage: &str, status: StageStatus) {
    let record = ExecutionRecord::pending(target, stage).transition(status);
    store.put(target, stage, record).unwrap();
}

#[tokio::test]
async fn test_fetch_refused_until_producer_succeeded() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    let runner = FakeRunner::new();
    let dest = dir.path().join("kubeconfig");

    let err = fetch(&store, runner.as_ref(), &graph(), &node(), "kubeconfig", &dest, &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Artifact(ref m) if m.contains("status: pending")));

    mark(&store, "gpu-node", "k3s", StageStatus::Failed);
    let err = fetch(&store, runner.as_ref(), &graph(), &node(), "kubeconfig", &dest, &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Artifact(ref m) if m.contains("status: failed")));

    assert!(runner.calls().is_empty());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_fetch_reports_read_failure() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    mark(&store, "gpu-node", "k3s", StageStatus::Succeeded);
    let runner = FakeRunner::new();
    runner.respond(
        &cat_script(),
        vec![Ok(ActionOutput::exited(1, "cat: /etc/rancher/k3s/k3s.yaml: No such file or directory"))],
    );
    let dest = dir.path().join("kubeconfig");

    let err = fetch(&store, runner.as_ref(), &graph(), &node(), "kubeconfig", &dest, &FetchOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Artifact(message) => {
            assert!(message.contains("exited with 1"));
            assert!(message.contains("No such file or directory"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_fetch_writes_rewritten_kubeconfig() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    mark(&store, "gpu-node", "k3s", StageStatus::Skipped);
    let runner = FakeRunner::new();
    runner.respond(&cat_script(), vec![Ok(ActionOutput::success(K3S_YAML))]);
    let default_dest = dir.path().join("artifacts/gpu-node/kubeconfig");

    let options = FetchOptions {
        dest: None,
        rewrite_server: true,
    };
    let path = fetch(&store, runner.as_ref(), &graph(), &node(), "kubeconfig", &default_dest, &options)
        .await
        .unwrap();

    assert_eq!(path, default_dest);
    assert_eq!(runner.calls(), vec![cat_script()]);
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("    server: https://192.168.0.176:6443\n"));
    assert!(!written.contains("127.0.0.1"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_fetch_to_explicit_dest_without_rewrite() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    mark(&store, "gpu-node", "k3s", StageStatus::Succeeded);
    let runner = FakeRunner::new();
    runner.respond(&cat_script(), vec![Ok(ActionOutput::success(K3S_YAML))]);
    let dest = dir.path().join("out/k3s.yaml");

    let options = FetchOptions {
        dest: Some(dest.clone()),
        rewrite_server: false,
    };
    let path = fetch(
        &store,
        runner.as_ref(),
        &graph(),
        &node(),
        "kubeconfig",
        &dir.path().join("unused"),
        &options,
    )
    .await
    .unwrap();

    assert_eq!(path, dest);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), K3S_YAML);
}

#[tokio::test]
async fn test_unknown_artifact_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    let runner = FakeRunner::new();

    let err = fetch(
        &store,
        runner.as_ref(),
        &graph(),
        &node(),
        "admin-token",
        &dir.path().join("x"),
        &FetchOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
