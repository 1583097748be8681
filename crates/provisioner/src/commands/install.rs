//! Install command - run stages in dependency order.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use provisioner::{ui, FailurePolicy, RunOptions};
use tracing::info;

use super::{combined_exit_code, Context, Workspace};

/// Run the install plan against one or all targets.
#[derive(Args)]
pub struct InstallCommand {
    /// Target to install (defaults to the first declared target).
    #[arg(short, long, conflicts_with = "all_targets")]
    target: Option<String>,

    /// Install every declared target concurrently.
    #[arg(long)]
    all_targets: bool,

    /// Only run these stages (and their dependencies).
    #[arg(short, long = "stage")]
    stages: Vec<String>,

    /// Re-run stages even if already applied.
    #[arg(long)]
    force: bool,

    /// Keep running stages that do not depend on a failed stage.
    #[arg(long)]
    keep_going: bool,
}

impl InstallCommand {
    /// Run the install command.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file, target or state store is unusable.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let options = RunOptions {
            force: self.force,
            policy: if self.keep_going {
                FailurePolicy::KeepGoing
            } else {
                FailurePolicy::FailFast
            },
            only: self.stages.clone(),
        };
        let engine = ws.engine(&ctx.cancel);

        let reports = if self.all_targets {
            let targets = ws
                .resolver
                .names()
                .into_iter()
                .map(|name| ws.resolver.resolve(name))
                .collect::<provisioner::Result<Vec<_>>>()?;
            info!(targets = targets.len(), "Installing all targets");
            engine
                .install_all(targets, Arc::new(ws.graph), options)
                .await?
        } else {
            let target = ws.resolve(self.target.as_deref())?;
            vec![engine.install(&target, &ws.graph, &options).await?]
        };

        if !ctx.emit_json(&reports)? {
            for report in &reports {
                ui::print_report(report);
            }
        }
        Ok(combined_exit_code(&reports))
    }
}
