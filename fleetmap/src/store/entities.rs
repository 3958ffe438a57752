//! Entity snapshot cache.
//!
//! One row per entity type, replaced wholesale on each successful fetch.
//! Rows are never merged so a reader always sees one consistent snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::persist::{collect_files, is_safe_key, remove_if_exists, write_atomic, KeyedLocks};
use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntitySnapshot {
    pub entity_type: String,
    pub payload: Value,
    pub count: usize,
    pub updated_at: DateTime<Utc>,
}

impl CachedEntitySnapshot {
    /// Decode the payload as a list of entities.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug)]
pub struct EntitySnapshotCache {
    dir: Option<PathBuf>,
    rows: RwLock<BTreeMap<String, CachedEntitySnapshot>>,
    locks: KeyedLocks,
}

impl EntitySnapshotCache {
    pub(crate) fn in_memory() -> Self {
        Self {
            dir: None,
            rows: RwLock::new(BTreeMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub(crate) async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        let scan_dir = dir.clone();
        let rows = tokio::task::spawn_blocking(move || load_snapshots(&scan_dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(types = rows.len(), "Entity snapshots loaded");
        Ok(Self {
            dir: Some(dir),
            rows: RwLock::new(rows),
            locks: KeyedLocks::default(),
        })
    }

    /// Replace the snapshot for `entity_type` with `items`.
    pub async fn put<T: Serialize>(&self, entity_type: &str, items: &[T]) -> Result<(), StoreError> {
        if !is_safe_key(entity_type) {
            return Err(StoreError::InvalidKey(entity_type.to_string()));
        }
        let snapshot = CachedEntitySnapshot {
            entity_type: entity_type.to_string(),
            payload: serde_json::to_value(items)?,
            count: items.len(),
            updated_at: Utc::now(),
        };

        let _guard = self.locks.lock(entity_type).await;
        if let Some(dir) = &self.dir {
            let bytes = serde_json::to_vec(&snapshot)?;
            write_atomic(&dir.join(format!("{entity_type}.json")), &bytes).await?;
        }
        self.rows.write().insert(entity_type.to_string(), snapshot);
        debug!(entity_type, count = items.len(), "Entity snapshot replaced");
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<CachedEntitySnapshot> {
        self.rows.read().get(entity_type).cloned()
    }

    /// Decode the snapshot for `entity_type`, if present.
    pub fn get_as<T: DeserializeOwned>(&self, entity_type: &str) -> Result<Option<Vec<T>>, StoreError> {
        self.get(entity_type).map(|s| s.decode()).transpose()
    }

    pub fn types(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub async fn remove(&self, entity_type: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(entity_type).await;
        if let Some(dir) = &self.dir {
            if is_safe_key(entity_type) {
                remove_if_exists(&dir.join(format!("{entity_type}.json"))).await?;
            }
        }
        Ok(self.rows.write().remove(entity_type).is_some())
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entity_type in self.types() {
            if self.remove(&entity_type).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn load_snapshots(dir: &Path) -> Result<BTreeMap<String, CachedEntitySnapshot>, StoreError> {
    let mut rows = BTreeMap::new();
    for path in collect_files(dir, "json")? {
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<CachedEntitySnapshot>(&bytes) {
            Ok(snapshot) => {
                rows.insert(snapshot.entity_type.clone(), snapshot);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
        }
    }
    Ok(rows)
}
