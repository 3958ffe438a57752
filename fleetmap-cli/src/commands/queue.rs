//! Offline action queue CLI commands.

use std::sync::Arc;

use clap::Subcommand;
use fleetmap::store::{ActionKind, PendingAction};
use fleetmap::sync::{HttpMutationClient, NetworkState, SyncQueueManager, SyncTrigger};
use serde_json::Value;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Queue action subcommands.
#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// List pending and rejected actions
    List {
        /// Include actions that were already synced
        #[arg(long)]
        all: bool,
    },

    /// Capture an action without sending it
    Add {
        /// Action kind (e.g., update-vehicle, log-fuel)
        kind: String,

        /// JSON payload
        payload: String,

        /// Explicit ordering key; defaults to the configured rule for the kind
        #[arg(long)]
        key: Option<String>,
    },

    /// Deliver pending actions to the configured API
    Sync,

    /// Remove a queued action
    Discard {
        /// Action id as shown by `queue list`
        id: String,
    },

    /// Remove actions that were already synced
    Clear,
}

/// Run a queue subcommand.
pub fn run(action: QueueAction) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("queue");

    runner.block_on(async {
        let store = runner.open_store().await?;
        let sync_config = runner.config().sync.clone();

        match action {
            QueueAction::List { all } => {
                let actions: Vec<PendingAction> = store
                    .actions()
                    .all()
                    .into_iter()
                    .filter(|a| all || !a.synced)
                    .collect();
                if actions.is_empty() {
                    println!("No queued actions");
                }
                for action in &actions {
                    print_action(action);
                }
            }
            QueueAction::Add { kind, payload, key } => {
                let kind: ActionKind = kind.parse()?;
                let payload: Value = serde_json::from_str(&payload)
                    .map_err(|e| CliError::InvalidArgument(format!("payload is not JSON: {}", e)))?;
                let key = key.or_else(|| sync_config.ordering.key_for(kind, &payload));
                let action = store.actions().enqueue(kind, payload, key).await?;
                println!("Queued {} ({})", action.id, action.kind);
                println!("{} actions pending", store.actions().pending_count());
            }
            QueueAction::Sync => {
                let client = HttpMutationClient::with_timeout(
                    sync_config.base_url.clone(),
                    sync_config.request_timeout,
                )?;
                println!("Syncing with {}", sync_config.base_url);
                let manager = SyncQueueManager::new(
                    store,
                    Arc::new(client),
                    Arc::new(NetworkState::new(true)),
                    sync_config,
                );
                let report = manager.sync(SyncTrigger::Manual).await?;
                println!("  Synced:   {}", report.synced);
                println!("  Failed:   {}", report.failed);
                println!("  Rejected: {}", report.rejected);
                println!("  Skipped:  {}", report.skipped);
                println!("  Pending:  {}", report.pending);
            }
            QueueAction::Discard { id } => {
                if store.actions().discard(&id).await? {
                    println!("Discarded {}", id);
                } else {
                    return Err(CliError::InvalidArgument(format!("no action with id {}", id)));
                }
            }
            QueueAction::Clear => {
                let removed = store.actions().clear_synced().await?;
                println!("Removed {} synced actions", removed);
            }
        }
        Ok::<(), CliError>(())
    })
}

fn print_action(action: &PendingAction) {
    let status = if action.synced {
        "synced"
    } else if action.rejected {
        "rejected"
    } else {
        "pending"
    };
    println!(
        "{:>4}  {}  {:<24} {:<9} retries={} key={}",
        action.sequence,
        action.id,
        action.kind.to_string(),
        status,
        action.retry_count,
        action.ordering_key.as_deref().unwrap_or("-")
    );
    if let Some(error) = &action.last_error {
        println!("      last error: {}", error);
    }
}
