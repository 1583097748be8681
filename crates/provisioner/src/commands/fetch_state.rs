//! Fetch-state command - copy an artifact produced by a stage.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use provisioner::artifact::{self, FetchOptions};
use provisioner::{ui, ShellRunner};
use serde_json::json;

use super::{Context, Workspace};

/// Copy an artifact (e.g. the cluster kubeconfig) from a target.
#[derive(Args)]
pub struct FetchStateCommand {
    /// Artifact name as declared by a stage.
    #[arg(default_value = "kubeconfig")]
    artifact: String,

    /// Target to fetch from (defaults to the first declared target).
    #[arg(short, long)]
    target: Option<String>,

    /// Write the artifact here instead of the state directory.
    #[arg(long)]
    dest: Option<PathBuf>,

    /// Keep loopback server addresses as they are on the target.
    #[arg(long)]
    no_rewrite: bool,
}

impl FetchStateCommand {
    /// Run the fetch-state command.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact is unknown, its stage has not
    /// succeeded, or the file cannot be copied.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let target = ws.resolve(self.target.as_deref())?;
        let options = FetchOptions {
            dest: self.dest.clone(),
            rewrite_server: !self.no_rewrite,
        };

        let path = artifact::fetch(
            &ws.store,
            &ShellRunner::new(),
            &ws.graph,
            &target,
            &self.artifact,
            &ws.config.artifact_path(&target.name, &self.artifact),
            &options,
        )
        .await?;

        let summary = json!({
            "target": target.name,
            "artifact": self.artifact,
            "path": path,
        });
        if !ctx.emit_json(&summary)? {
            ui::print_success(&format!("Fetched {} from {}", self.artifact, target.name));
            ui::print_kv("path", &path.display().to_string());
        }
        Ok(0)
    }
}
