//! Analytics snapshot cache with a time-to-live.
//!
//! Expired rows are not swept eagerly: a read that finds one deletes it and
//! reports a miss. `purge_expired` is available for periodic maintenance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::persist::{collect_files, is_safe_key, remove_if_exists, write_atomic, KeyedLocks};
use super::StoreError;

/// Default lifetime of an analytics snapshot, in seconds.
pub const DEFAULT_ANALYTICS_TTL_SECS: i64 = 3_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub key: String,
    pub data: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct AnalyticsCache {
    dir: Option<PathBuf>,
    ttl: Duration,
    rows: RwLock<BTreeMap<String, AnalyticsSnapshot>>,
    locks: KeyedLocks,
}

impl AnalyticsCache {
    pub(crate) fn in_memory(ttl: Duration) -> Self {
        Self {
            dir: None,
            ttl,
            rows: RwLock::new(BTreeMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub(crate) async fn open(dir: PathBuf, ttl: Duration) -> Result<Self, StoreError> {
        let scan_dir = dir.clone();
        let rows = tokio::task::spawn_blocking(move || load_analytics(&scan_dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(Self {
            dir: Some(dir),
            ttl,
            rows: RwLock::new(rows),
            locks: KeyedLocks::default(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a snapshot with the default TTL.
    pub async fn set(&self, key: &str, data: Value) -> Result<AnalyticsSnapshot, StoreError> {
        self.set_with_ttl(key, data, self.ttl).await
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
    ) -> Result<AnalyticsSnapshot, StoreError> {
        if !is_safe_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let now = Utc::now();
        let snapshot = AnalyticsSnapshot {
            key: key.to_string(),
            data,
            stored_at: now,
            expires_at: now + ttl,
        };

        let _guard = self.locks.lock(key).await;
        if let Some(dir) = &self.dir {
            write_atomic(&dir.join(format!("{key}.json")), &serde_json::to_vec(&snapshot)?).await?;
        }
        self.rows.write().insert(key.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Fetch a live snapshot; an expired one is deleted and reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<AnalyticsSnapshot>, StoreError> {
        let now = Utc::now();
        let row = self.rows.read().get(key).cloned();
        match row {
            Some(snapshot) if snapshot.is_expired(now) => {
                debug!(key, "Analytics snapshot expired");
                self.delete(key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Delete every expired row.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .rows
            .read()
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.key.clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        let keys: Vec<String> = self.rows.read().keys().cloned().collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Row count, including rows that have expired but not yet been read.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(key).await;
        if let Some(dir) = &self.dir {
            remove_if_exists(&dir.join(format!("{key}.json"))).await?;
        }
        Ok(self.rows.write().remove(key).is_some())
    }
}

fn load_analytics(dir: &Path) -> Result<BTreeMap<String, AnalyticsSnapshot>, StoreError> {
    let mut rows = BTreeMap::new();
    for path in collect_files(dir, "json")? {
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<AnalyticsSnapshot>(&bytes) {
            Ok(snapshot) => {
                rows.insert(snapshot.key.clone(), snapshot);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable analytics row"),
        }
    }
    Ok(rows)
}
