//! Key-value metadata, persisted as a single `metadata.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;

use super::persist::write_atomic;
use super::StoreError;

/// Last successful full sync, RFC 3339.
pub const LAST_SYNC_KEY: &str = "last_sync_at";

/// Schema version of the on-disk layout.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

#[derive(Debug)]
pub struct MetadataStore {
    path: Option<PathBuf>,
    rows: RwLock<BTreeMap<String, Value>>,
    // The whole file is rewritten on each change, so writers take one lock.
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            rows: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let rows = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            rows: RwLock::new(rows),
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.rows.read().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.rows.read().clone();
        next.insert(key.to_string(), value);
        self.write(&next).await?;
        *self.rows.write() = next;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.rows.read().clone();
        let removed = next.remove(key);
        if removed.is_some() {
            self.write(&next).await?;
            *self.rows.write() = next;
        }
        Ok(removed)
    }

    async fn write(&self, rows: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec_pretty(rows)?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MetadataStore::in_memory();
        store.set(LAST_SYNC_KEY, json!("2024-05-01T10:00:00Z")).await.unwrap();
        assert_eq!(store.get_str(LAST_SYNC_KEY).as_deref(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(store.keys(), vec![LAST_SYNC_KEY.to_string()]);

        assert!(store.remove(LAST_SYNC_KEY).await.unwrap().is_some());
        assert!(store.remove(LAST_SYNC_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        {
            let store = MetadataStore::open(path.clone()).await.unwrap();
            store.set(SCHEMA_VERSION_KEY, json!(1)).await.unwrap();
        }
        let store = MetadataStore::open(path).await.unwrap();
        assert_eq!(store.get(SCHEMA_VERSION_KEY), Some(json!(1)));
    }
}
