//! Offline cache CLI commands.

use clap::Subcommand;
use fleetmap::platform::{ControlSignal, PlatformBridge};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show row counts for every offline table
    Stats,

    /// Drop cached tiles, entity snapshots and analytics (pending actions are kept)
    Clear,

    /// Apply retention: expire old tiles and analytics, enforce the tile quota
    /// and drop synced actions
    Maintain,
}

/// Run a cache subcommand.
pub fn run(action: CacheAction) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("cache");
    let dir = runner
        .config()
        .store
        .dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "(in memory)".to_string());

    runner.block_on(async {
        let store = runner.open_store().await?;
        match action {
            CacheAction::Stats => {
                println!("Offline store: {}", dir);
                print!("{}", store.stats());
            }
            CacheAction::Clear => {
                println!("Clearing offline cache at: {}", dir);
                let outcome = PlatformBridge::new(store.clone())
                    .handle(ControlSignal::ClearCache)
                    .await?;
                println!(
                    "Removed {} rows, {} actions still pending",
                    outcome.rows_cleared,
                    store.actions().pending_count()
                );
            }
            CacheAction::Maintain => {
                let report = store.maintain().await?;
                println!("Tiles expired:      {}", report.tiles_expired);
                println!("Tiles over quota:   {}", report.tiles_over_quota);
                println!("Analytics expired:  {}", report.analytics_expired);
                println!("Synced actions:     {}", report.actions_cleared);
            }
        }
        Ok::<(), CliError>(())
    })
}
