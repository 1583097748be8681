//! Staged provisioning and GPU verification.
//!
//! Turns a bare host into a GPU-ready single-node Kubernetes cluster by
//! running declarative stages in dependency order, remembering what already
//! ran so re-runs are cheap, and then certifying the accelerators with
//! parallel synthetic workloads.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use provisioner::{Engine, RunConfig, RunOptions, ShellRunner, StageGraph, StateStore, TargetResolver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load("provision.yaml".as_ref())?;
//!     let graph = StageGraph::build(config.stages.clone())?;
//!     let target = TargetResolver::new(&config.targets).resolve("gpu-node")?;
//!     let store = Arc::new(StateStore::open(&config.state_dir)?);
//!     let engine = Engine::new(store, Arc::new(ShellRunner::new()));
//!     let report = engine.install(&target, &graph, &RunOptions::default()).await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod report;
pub mod runner;
pub mod stage;
pub mod state;
pub mod target;
pub mod ui;
pub mod verify;

pub use config::{RunConfig, SecretSpec};
pub use engine::{Engine, FailurePolicy, RunOptions};
pub use error::{ActionError, Error, Result};
pub use graph::StageGraph;
pub use report::{RunReport, StageOutcome};
pub use runner::{Action, ActionOutput, ActionRunner, ShellRunner};
pub use stage::{RetryPolicy, Stage};
pub use state::{ExecutionRecord, StageStatus, StateStore};
pub use target::{ResolvedTarget, TargetResolver, TargetSpec};
pub use verify::{ClusterClient, KubeCluster, VerificationJob, VerificationResult, VerificationRunner};
