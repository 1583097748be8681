//! Status command - show recorded stage status.

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Args;
use provisioner::ui;

use super::{Context, Workspace};

/// Print the execution records of one or all targets.
#[derive(Args)]
pub struct StatusCommand {
    /// Only show this target.
    #[arg(short, long)]
    target: Option<String>,
}

impl StatusCommand {
    /// Run the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if the run file or state store is unusable.
    pub fn run(&self, ctx: &Context) -> Result<i32> {
        let ws = Workspace::load(&ctx.config)?;
        let targets: Vec<String> = match &self.target {
            Some(name) if ws.resolver.names().contains(&name.as_str()) => vec![name.clone()],
            Some(name) => return Err(provisioner::Error::TargetNotFound(name.clone()).into()),
            None => ws.resolver.names().into_iter().map(str::to_string).collect(),
        };

        let order = ws.graph.install_order();
        let mut all = BTreeMap::new();
        for target in &targets {
            all.insert(target.clone(), ws.store.records(target)?);
        }

        if !ctx.emit_json(&all)? {
            for (target, records) in &all {
                ui::print_status(target, records, &order);
            }
        }
        Ok(0)
    }
}
