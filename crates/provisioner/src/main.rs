//! Provision CLI.
//!
//! Installs, verifies and tears down a GPU-ready single-node Kubernetes
//! cluster from a declarative run file. Every command is idempotent:
//! re-running it resumes from the recorded state.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use provisioner::error::{EXIT_STAGE_FAILURE, EXIT_USAGE};
use provisioner::{ui, Error};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::fetch_state::FetchStateCommand;
use commands::install::InstallCommand;
use commands::plan::PlanCommand;
use commands::status::StatusCommand;
use commands::uninstall::UninstallCommand;
use commands::verify::VerifyCommand;
use commands::{Context, OutputFormat};

/// Staged GPU cluster provisioning.
#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Staged GPU cluster provisioning and verification",
    long_about = "Provision a single-node GPU Kubernetes cluster from a run file.\n\n\
                  Stages run in dependency order and are recorded in the state\n\
                  directory, so re-running a command only does what is left.\n\
                  `verify` certifies the GPUs with parallel synthetic workloads."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Run file.
    #[arg(short, long, global = true, env = "PROVISION_CONFIG", default_value = provisioner::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run stages in dependency order.
    Install(InstallCommand),

    /// Tear stages down in reverse dependency order.
    Uninstall(UninstallCommand),

    /// Copy an artifact produced by a stage (e.g. the kubeconfig).
    FetchState(FetchStateCommand),

    /// Run a GPU verification job against the cluster.
    Verify(VerifyCommand),

    /// Show the stages an install would run.
    Plan(PlanCommand),

    /// Show recorded stage status.
    Status(StatusCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,provisioner=debug,provision=debug")
        } else {
            EnvFilter::new("warn,provisioner=info,provision=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current action");
            token.cancel();
        }
    });

    let ctx = Context {
        config: cli.config,
        output: cli.output,
        cancel,
    };

    let result = match cli.command {
        Commands::Install(cmd) => cmd.run(&ctx).await,
        Commands::Uninstall(cmd) => cmd.run(&ctx).await,
        Commands::FetchState(cmd) => cmd.run(&ctx).await,
        Commands::Verify(cmd) => cmd.run(&ctx).await,
        Commands::Plan(cmd) => cmd.run(&ctx),
        Commands::Status(cmd) => cmd.run(&ctx),
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            ui::print_error(&format!("{err:#}"));
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<Error>() {
        e.exit_code()
    } else if err.downcast_ref::<clap::Error>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_STAGE_FAILURE
    }
}
