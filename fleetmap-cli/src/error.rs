//! CLI error type.

use std::io;

use fleetmap::config::ConfigError;
use fleetmap::logging::LoggingError;
use fleetmap::platform::PlatformError;
use fleetmap::runtime::RuntimeError;
use fleetmap::simulation::SimulationError;
use fleetmap::store::StoreError;
use fleetmap::sync::SyncError;
use fleetmap::telemetry::TelemetryError;
use thiserror::Error;

/// Errors surfaced to the user by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] ConfigError),

    #[error("Failed to initialize logging: {0}")]
    Logging(#[from] LoggingError),

    #[error("Offline store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Map runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Platform signal failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to start async runtime: {0}")]
    AsyncRuntime(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
