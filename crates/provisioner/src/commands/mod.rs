//! CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use provisioner::report::RunReport;
use provisioner::{Engine, ResolvedTarget, RunConfig, ShellRunner, StageGraph, StateStore, TargetResolver};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod fetch_state;
pub mod install;
pub mod plan;
pub mod status;
pub mod uninstall;
pub mod verify;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable console output.
    Text,
    /// Pretty-printed JSON on stdout.
    Json,
}

/// Options shared by every command.
pub struct Context {
    /// Run file path.
    pub config: PathBuf,
    /// Output format.
    pub output: OutputFormat,
    /// Cancelled on Ctrl-C.
    pub cancel: CancellationToken,
}

impl Context {
    /// Print `value` as JSON when JSON output was requested.
    ///
    /// Returns `false` for text output so the caller can render it instead.
    pub fn emit_json<T: Serialize>(&self, value: &T) -> Result<bool> {
        if self.output == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(value)?);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Everything loaded from the run file.
pub struct Workspace {
    pub config: RunConfig,
    pub graph: StageGraph,
    pub resolver: TargetResolver,
    pub store: Arc<StateStore>,
}

impl Workspace {
    /// Load the run file, build the stage graph and open the state store.
    pub fn load(path: &Path) -> Result<Self> {
        let config = RunConfig::load(path)
            .with_context(|| format!("Failed to load run file {}", path.display()))?;
        let graph = StageGraph::build(config.stages.clone())?;
        let resolver = TargetResolver::new(&config.targets);
        let store = Arc::new(StateStore::open(&config.state_dir)?);
        debug!(
            stages = graph.len(),
            targets = config.targets.len(),
            state_dir = %config.state_dir.display(),
            "Loaded run file"
        );
        Ok(Self {
            config,
            graph,
            resolver,
            store,
        })
    }

    /// Name of the requested target, or the first declared one.
    pub fn target_name(&self, requested: Option<&str>) -> Result<String> {
        requested
            .or_else(|| self.config.default_target())
            .map(str::to_string)
            .ok_or_else(|| provisioner::Error::Config("No target declared".into()).into())
    }

    /// Resolve the requested target.
    pub fn resolve(&self, requested: Option<&str>) -> Result<ResolvedTarget> {
        let name = self.target_name(requested)?;
        Ok(self.resolver.resolve(&name)?)
    }

    /// Engine running actions through the shell transport.
    pub fn engine(&self, cancel: &CancellationToken) -> Engine {
        Engine::new(Arc::clone(&self.store), Arc::new(ShellRunner::new()))
            .with_secrets(self.config.secrets.clone())
            .with_cancellation(cancel.clone())
    }
}

/// Combined exit code of several reports: abort wins over failure.
pub fn combined_exit_code(reports: &[RunReport]) -> i32 {
    reports.iter().map(RunReport::exit_code).max().unwrap_or(0)
}
