//! Fleetmap CLI - Command-line interface
//!
//! Drives the fleetmap library: runs the fleet simulation through the map
//! runtime, inspects and syncs the offline action queue, maintains the
//! offline cache and edits the configuration file.

mod commands;
mod error;
mod runner;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use commands::queue::QueueAction;
use commands::simulate::SimulateArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "fleetmap", version, about = "Fleet map runtime and telemetry pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the fleet simulation through a headless map runtime
    Simulate(SimulateArgs),

    /// Inspect and sync offline actions
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Manage the offline cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// View and modify configuration settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args),
        Commands::Queue { action } => commands::queue::run(action),
        Commands::Cache { action } => commands::cache::run(action),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
