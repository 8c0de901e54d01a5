//! `spanbot` -- CLI binary for the spanbot chat gateway.
//!
//! Subcommands:
//!
//! - `spanbot gateway start|run|stop|restart` -- gateway lifecycle.
//! - `spanbot status` -- gateway and store diagnostics.
//! - `spanbot cron ...` -- manage scheduled jobs.
//! - `spanbot sessions` -- list agent session bindings.
//! - `spanbot config` -- show the resolved configuration.
//! - `spanbot onboard` -- scaffold config and workspace files.
//! - `spanbot version` -- print the version.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// spanbot chat gateway CLI.
#[derive(Parser)]
#[command(name = "spanbot", about = "Multi-channel chat gateway for the iflow agent", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (overrides `~/.spanbot/config.json`).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway lifecycle (start, run, stop, restart).
    Gateway {
        #[command(subcommand)]
        action: commands::gateway::GatewayAction,
    },

    /// Show gateway and store status.
    Status,

    /// Manage scheduled (cron) jobs.
    Cron {
        #[command(subcommand)]
        action: commands::cron::CronAction,
    },

    /// List agent session bindings.
    Sessions,

    /// Show the resolved configuration.
    Config,

    /// Initialize config and workspace files.
    Onboard,

    /// Print the version.
    Version,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Gateway { action } => {
            commands::gateway::run(action, cli.config.as_deref()).await
        }
        Commands::Status => commands::status::run(cli.config.as_deref()),
        Commands::Cron { action } => commands::cron::run(action),
        Commands::Sessions => commands::sessions::run(),
        Commands::Config => commands::config_cmd::run(cli.config.as_deref()),
        Commands::Onboard => commands::onboard::run(),
        Commands::Version => {
            println!("spanbot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
