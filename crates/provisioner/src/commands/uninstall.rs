//! Uninstall command - tear stages down in reverse dependency order.

use anyhow::Result;
use clap::Args;
use provisioner::{ui, FailurePolicy, RunOptions};

use super::{Context, Workspace};

/// Run teardown actions in exact reverse install order.
#[derive(Args)]
pub struct UninstallCommand {
    /// Target to uninstall (defaults to the first declared target).
    #[arg(short, long)]
    target: Option<String>,

    /// Only tear down these stages.
    #[arg(short, long = "stage")]
    stages: Vec<String>,

    /// Keep tearing down stages after a failure where ordering allows.
    #[arg(long)]
    keep_going: bool,
}

impl UninstallCommand {
    /// Run the uninstall command.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file, target or state store is unusable.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let target = ws.resolve(self.target.as_deref())?;
        let options = RunOptions {
            force: false,
            policy: if self.keep_going {
                FailurePolicy::KeepGoing
            } else {
                FailurePolicy::FailFast
            },
            only: self.stages.clone(),
        };

        let report = ws
            .engine(&ctx.cancel)
            .uninstall(&target, &ws.graph, &options)
            .await?;

        if !ctx.emit_json(&report)? {
            ui::print_report(&report);
        }
        Ok(report.exit_code())
    }
}
