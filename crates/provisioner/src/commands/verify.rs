//! Verify command - certify GPUs with parallel synthetic workloads.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use provisioner::error::EXIT_OK;
use provisioner::{ui, KubeCluster, VerificationRunner};
use tracing::info;

use super::{Context, Workspace};

/// Run a verification job.
#[derive(Args)]
pub struct VerifyCommand {
    /// Verification job (defaults to the first declared job).
    job: Option<String>,

    /// Kubeconfig (defaults to the one fetched from the target).
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Target whose fetched kubeconfig is used.
    #[arg(short, long)]
    target: Option<String>,

    /// Leave the verification units in the cluster.
    #[arg(long)]
    keep_units: bool,
}

impl VerifyCommand {
    /// Run the verify command.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown or the cluster is unreachable.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let mut job = match &self.job {
            Some(name) => ws.config.job(name)?.clone(),
            None => ws
                .config
                .verification
                .first()
                .cloned()
                .ok_or_else(|| provisioner::Error::Config("No verification job declared".into()))?,
        };
        job.keep_units |= self.keep_units;

        let kubeconfig = match &self.kubeconfig {
            Some(path) => path.clone(),
            None => {
                let target = ws.target_name(self.target.as_deref())?;
                ws.config.artifact_path(&target, "kubeconfig")
            }
        };
        if !kubeconfig.exists() {
            return Err(provisioner::Error::Config(format!(
                "Kubeconfig {} not found; run fetch-state first or pass --kubeconfig",
                kubeconfig.display()
            ))
            .into());
        }
        info!(job = %job.name, kubeconfig = %kubeconfig.display(), "Starting verification");

        let cluster = KubeCluster::from_kubeconfig(&kubeconfig)
            .await
            .context("Failed to connect to the cluster")?;
        let runner = VerificationRunner::new(Arc::new(cluster)).with_cancellation(ctx.cancel.clone());
        let result = runner.verify(&job).await?;

        if !ctx.emit_json(&result)? {
            ui::print_verification(&result);
        }
        Ok(result.ensure_passed().map_or_else(|e| e.exit_code(), |()| EXIT_OK))
    }
}
