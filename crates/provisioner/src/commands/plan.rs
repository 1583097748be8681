//! Plan command - show what an install would run.

use anyhow::Result;
use clap::Args;
use provisioner::ui;
use serde_json::json;

use super::{Context, Workspace};

/// Print the stages still requiring execution.
#[derive(Args)]
pub struct PlanCommand {
    /// Target to plan for (defaults to the first declared target).
    #[arg(short, long)]
    target: Option<String>,

    /// Include stages that already succeeded.
    #[arg(long)]
    force: bool,
}

impl PlanCommand {
    /// Run the plan command.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file or state store is unusable.
    pub fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let target = ws.target_name(self.target.as_deref())?;
        let snapshot = ws.store.snapshot(&target)?;
        let pending = ws.graph.pending(&snapshot, self.force);

        let ids: Vec<&str> = pending.iter().map(|s| s.id.as_str()).collect();
        if !ctx.emit_json(&json!({ "target": target, "pending": ids }))? {
            ui::print_plan(&target, &pending, self.force);
        }
        Ok(0)
    }
}
