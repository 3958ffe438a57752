//! Shared setup for commands that touch the store or run the pipeline.

use std::future::Future;

use fleetmap::config::ConfigFile;
use fleetmap::logging::{init_logging, WorkerGuard};
use fleetmap::store::OfflineStore;
use tracing::info;

use crate::error::CliError;

/// Loaded configuration, installed logging and an async runtime.
pub struct CliRunner {
    config: ConfigFile,
    runtime: tokio::runtime::Runtime,
    _log_guard: WorkerGuard,
}

impl CliRunner {
    pub fn new() -> Result<Self, CliError> {
        Self::with_config(ConfigFile::load()?)
    }

    pub fn with_config(config: ConfigFile) -> Result<Self, CliError> {
        let log_guard = init_logging(&config.logging)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(CliError::AsyncRuntime)?;
        Ok(Self {
            config,
            runtime,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = fleetmap::VERSION,
            command,
            log_dir = %self.config.logging.dir.display(),
            "fleetmap starting"
        );
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Open the configured offline store.
    pub async fn open_store(&self) -> Result<OfflineStore, CliError> {
        Ok(OfflineStore::open_with(&self.config.store).await?)
    }
}
