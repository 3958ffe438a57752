//! Durable queue of mutations awaiting delivery.
//!
//! Actions are persisted as `actions/<seq>-<id>.json` and replayed in
//! sequence order. Failed actions stay queued for retry; only a confirmed
//! sync or an explicit discard removes them. A synced action is frozen: it
//! can only be cleaned up.
//!
//! ```text
//! enqueue ──► pending ──sync ok──► synced ──clear_synced──► (gone)
//!               │  ▲
//!     retryable │  │ next_attempt_at
//!               ▼  │
//!             failed ──permanent──► rejected ──discard──► (gone)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::persist::{collect_files, remove_if_exists, write_atomic, KeyedLocks};
use super::StoreError;

/// Closed set of mutations the application can capture offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateVehicle,
    UpdateVehicle,
    DeleteVehicle,
    AssignDriver,
    LogMaintenance,
    LogFuel,
    UpdateDeliveryStatus,
    AcknowledgeAlert,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::CreateVehicle,
        ActionKind::UpdateVehicle,
        ActionKind::DeleteVehicle,
        ActionKind::AssignDriver,
        ActionKind::LogMaintenance,
        ActionKind::LogFuel,
        ActionKind::UpdateDeliveryStatus,
        ActionKind::AcknowledgeAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateVehicle => "create_vehicle",
            ActionKind::UpdateVehicle => "update_vehicle",
            ActionKind::DeleteVehicle => "delete_vehicle",
            ActionKind::AssignDriver => "assign_driver",
            ActionKind::LogMaintenance => "log_maintenance",
            ActionKind::LogFuel => "log_fuel",
            ActionKind::UpdateDeliveryStatus => "update_delivery_status",
            ActionKind::AcknowledgeAlert => "acknowledge_alert",
        }
    }

    /// Path of the mutation endpoint, relative to the API base URL.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ActionKind::CreateVehicle => "/api/vehicles",
            ActionKind::UpdateVehicle => "/api/vehicles/update",
            ActionKind::DeleteVehicle => "/api/vehicles/delete",
            ActionKind::AssignDriver => "/api/assignments",
            ActionKind::LogMaintenance => "/api/maintenance",
            ActionKind::LogFuel => "/api/fuel",
            ActionKind::UpdateDeliveryStatus => "/api/deliveries/status",
            ActionKind::AcknowledgeAlert => "/api/alerts/acknowledge",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| StoreError::UnknownActionKind(s.to_string()))
    }
}

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    /// Insertion order; unique within a store.
    pub sequence: u64,
    pub kind: ActionKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub ordering_key: Option<String>,
    /// Earliest time the next delivery attempt may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Refused by the receiver; kept for the user to inspect or discard.
    #[serde(default)]
    pub rejected: bool,
}

impl PendingAction {
    /// Waiting for delivery (neither synced nor rejected).
    pub fn is_pending(&self) -> bool {
        !self.synced && !self.rejected
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |t| t <= now)
    }

    fn file_name(&self) -> String {
        format!("{:010}-{}.json", self.sequence, self.id)
    }
}

#[derive(Debug)]
pub struct ActionQueue {
    dir: Option<PathBuf>,
    rows: RwLock<BTreeMap<u64, PendingAction>>,
    next_sequence: AtomicU64,
    locks: KeyedLocks,
}

impl ActionQueue {
    pub(crate) fn in_memory() -> Self {
        Self {
            dir: None,
            rows: RwLock::new(BTreeMap::new()),
            next_sequence: AtomicU64::new(1),
            locks: KeyedLocks::default(),
        }
    }

    pub(crate) async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        let scan_dir = dir.clone();
        let rows = tokio::task::spawn_blocking(move || load_actions(&scan_dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(actions = rows.len(), "Action queue loaded");
        let next_sequence = rows.keys().next_back().map_or(1, |s| s + 1);
        Ok(Self {
            dir: Some(dir),
            rows: RwLock::new(rows),
            next_sequence: AtomicU64::new(next_sequence),
            locks: KeyedLocks::default(),
        })
    }

    /// Persist a new action at the back of the queue.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        payload: Value,
        ordering_key: Option<String>,
    ) -> Result<PendingAction, StoreError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let action = {
            let action = PendingAction {
                id: new_action_id(sequence),
                sequence,
                kind,
                payload,
                created_at: Utc::now(),
                synced: false,
                synced_at: None,
                retry_count: 0,
                last_error: None,
                ordering_key,
                next_attempt_at: None,
                rejected: false,
            };
            self.rows.write().insert(sequence, action.clone());
            action
        };

        if let Err(e) = self.persist(&action).await {
            self.rows.write().remove(&action.sequence);
            return Err(e);
        }
        debug!(action_id = %action.id, kind = %action.kind, "Action enqueued");
        Ok(action)
    }

    /// Pending actions in insertion order.
    pub fn get_unsynced(&self) -> Vec<PendingAction> {
        self.rows
            .read()
            .values()
            .filter(|a| a.is_pending())
            .cloned()
            .collect()
    }

    /// Actions refused by the receiver.
    pub fn rejected(&self) -> Vec<PendingAction> {
        self.rows
            .read()
            .values()
            .filter(|a| a.rejected && !a.synced)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<PendingAction> {
        self.rows.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<PendingAction> {
        self.rows.read().values().find(|a| a.id == id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.rows.read().values().filter(|a| a.is_pending()).count()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Record a confirmed delivery. Marking an already-synced action again
    /// is a no-op.
    pub async fn mark_synced(&self, id: &str) -> Result<PendingAction, StoreError> {
        self.modify(id, |action| {
            if action.synced {
                return Ok(false);
            }
            action.synced = true;
            action.synced_at = Some(Utc::now());
            action.last_error = None;
            action.next_attempt_at = None;
            Ok(true)
        })
        .await
    }

    /// Record a retryable failure. The action stays queued.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<PendingAction, StoreError> {
        self.modify(id, |action| {
            ensure_mutable(action)?;
            action.retry_count += 1;
            action.last_error = Some(error.to_string());
            action.next_attempt_at = next_attempt_at;
            Ok(true)
        })
        .await
    }

    /// Record a permanent refusal. The action is kept but no longer retried.
    pub async fn mark_rejected(&self, id: &str, error: &str) -> Result<PendingAction, StoreError> {
        self.modify(id, |action| {
            ensure_mutable(action)?;
            action.rejected = true;
            action.last_error = Some(error.to_string());
            action.next_attempt_at = None;
            Ok(true)
        })
        .await
    }

    /// Delete every synced action.
    pub async fn clear_synced(&self) -> Result<usize, StoreError> {
        let synced: Vec<PendingAction> = self
            .rows
            .read()
            .values()
            .filter(|a| a.synced)
            .cloned()
            .collect();
        let mut removed = 0;
        for action in synced {
            if self.remove(&action).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Explicitly drop an action regardless of its state.
    pub async fn discard(&self, id: &str) -> Result<bool, StoreError> {
        match self.get(id) {
            Some(action) => {
                let removed = self.remove(&action).await?;
                if removed {
                    debug!(action_id = %id, "Action discarded");
                }
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    async fn modify(
        &self,
        id: &str,
        f: impl FnOnce(&mut PendingAction) -> Result<bool, StoreError>,
    ) -> Result<PendingAction, StoreError> {
        let _guard = self.locks.lock(id).await;
        let mut action = self
            .get(id)
            .ok_or_else(|| StoreError::ActionNotFound(id.to_string()))?;
        if !f(&mut action)? {
            return Ok(action);
        }
        self.persist(&action).await?;
        self.rows.write().insert(action.sequence, action.clone());
        Ok(action)
    }

    async fn persist(&self, action: &PendingAction) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            let bytes = serde_json::to_vec_pretty(action)?;
            write_atomic(&dir.join(action.file_name()), &bytes).await?;
        }
        Ok(())
    }

    async fn remove(&self, action: &PendingAction) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(&action.id).await;
        if let Some(dir) = &self.dir {
            remove_if_exists(&dir.join(action.file_name())).await?;
        }
        Ok(self.rows.write().remove(&action.sequence).is_some())
    }
}

fn ensure_mutable(action: &PendingAction) -> Result<(), StoreError> {
    if action.synced {
        Err(StoreError::ImmutableAction(action.id.clone()))
    } else {
        Ok(())
    }
}

fn new_action_id(sequence: u64) -> String {
    format!(
        "act-{}-{sequence}-{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

fn load_actions(dir: &Path) -> Result<BTreeMap<u64, PendingAction>, StoreError> {
    let mut rows = BTreeMap::new();
    for path in collect_files(dir, "json")? {
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<PendingAction>(&bytes) {
            Ok(action) => {
                rows.insert(action.sequence, action);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable action"),
        }
    }
    Ok(rows)
}
