//! Map tile cache.
//!
//! Tiles are stored as `tiles/<z>/<x>/<y>.bin` (bincode) and mirrored in
//! memory. Rows are overwritten on refresh and evicted by age, zoom level or
//! count quota.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::persist::{collect_files, remove_if_exists, write_atomic, KeyedLocks};
use super::StoreError;

/// Slippy-map tile coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A cached tile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTile {
    pub key: TileKey,
    pub data: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// The tile table.
#[derive(Debug)]
pub struct TileCache {
    dir: Option<PathBuf>,
    rows: RwLock<HashMap<TileKey, CachedTile>>,
    locks: KeyedLocks,
}

impl TileCache {
    pub(crate) fn in_memory() -> Self {
        Self {
            dir: None,
            rows: RwLock::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub(crate) async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        let scan_dir = dir.clone();
        let rows = tokio::task::spawn_blocking(move || load_tiles(&scan_dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(tiles = rows.len(), "Tile cache loaded");
        Ok(Self {
            dir: Some(dir),
            rows: RwLock::new(rows),
            locks: KeyedLocks::default(),
        })
    }

    fn path_for(&self, key: &TileKey) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| {
            d.join(key.z.to_string())
                .join(key.x.to_string())
                .join(format!("{}.bin", key.y))
        })
    }

    /// Store or overwrite a tile, timestamped now.
    pub async fn set(&self, key: TileKey, data: Vec<u8>) -> Result<(), StoreError> {
        self.insert(CachedTile {
            key,
            data,
            fetched_at: Utc::now(),
        })
        .await
    }

    /// Store or overwrite a full row.
    pub async fn insert(&self, tile: CachedTile) -> Result<(), StoreError> {
        let _guard = self.locks.lock(&tile.key.to_string()).await;
        if let Some(path) = self.path_for(&tile.key) {
            let bytes = bincode::serialize(&tile)?;
            write_atomic(&path, &bytes).await?;
        }
        self.rows.write().insert(tile.key, tile);
        Ok(())
    }

    pub fn get(&self, key: &TileKey) -> Option<CachedTile> {
        self.rows.read().get(key).cloned()
    }

    pub fn has(&self, key: &TileKey) -> bool {
        self.rows.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.rows.read().values().map(|t| t.data.len() as u64).sum()
    }

    /// Remove tiles fetched more than `max_age` ago.
    pub async fn clear_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - max_age;
        self.remove_where(|t| t.fetched_at < cutoff).await
    }

    /// Remove all tiles at one zoom level.
    pub async fn clear_zoom(&self, z: u8) -> Result<usize, StoreError> {
        self.remove_where(|t| t.key.z == z).await
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.remove_where(|_| true).await
    }

    /// Keep at most `max_tiles`, evicting the oldest first.
    pub async fn enforce_quota(&self, max_tiles: usize) -> Result<usize, StoreError> {
        let victims: Vec<TileKey> = {
            let rows = self.rows.read();
            if rows.len() <= max_tiles {
                return Ok(0);
            }
            let mut by_age: Vec<&CachedTile> = rows.values().collect();
            by_age.sort_by_key(|t| (t.fetched_at, t.key));
            by_age
                .iter()
                .take(rows.len() - max_tiles)
                .map(|t| t.key)
                .collect()
        };
        self.remove_keys(victims).await
    }

    async fn remove_where(&self, predicate: impl Fn(&CachedTile) -> bool) -> Result<usize, StoreError> {
        let victims: Vec<TileKey> = self
            .rows
            .read()
            .values()
            .filter(|t| predicate(t))
            .map(|t| t.key)
            .collect();
        self.remove_keys(victims).await
    }

    async fn remove_keys(&self, keys: Vec<TileKey>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in keys {
            let _guard = self.locks.lock(&key.to_string()).await;
            if let Some(path) = self.path_for(&key) {
                remove_if_exists(&path).await?;
            }
            if self.rows.write().remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn load_tiles(dir: &Path) -> Result<HashMap<TileKey, CachedTile>, StoreError> {
    let mut rows = HashMap::new();
    for path in collect_files(dir, "bin")? {
        let bytes = std::fs::read(&path)?;
        match bincode::deserialize::<CachedTile>(&bytes) {
            Ok(tile) => {
                rows.insert(tile.key, tile);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable tile"),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tile(z: u8, x: u32, y: u32, age_hours: i64) -> CachedTile {
        CachedTile {
            key: TileKey::new(z, x, y),
            data: vec![z; 16],
            fetched_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[tokio::test]
    async fn test_set_get_has() {
        let cache = TileCache::in_memory();
        let key = TileKey::new(12, 2170, 1327);
        assert!(!cache.has(&key));

        cache.set(key, vec![1, 2, 3]).await.unwrap();
        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).unwrap().data, vec![1, 2, 3]);
        assert_eq!(cache.total_bytes(), 3);
    }

    #[tokio::test]
    async fn test_overwrite_on_refresh() {
        let cache = TileCache::in_memory();
        let key = TileKey::new(1, 0, 0);
        cache.set(key, vec![1]).await.unwrap();
        cache.set(key, vec![2, 2]).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).unwrap().data, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_clear_by_age_and_zoom() {
        let cache = TileCache::in_memory();
        cache.insert(tile(10, 1, 1, 48)).await.unwrap();
        cache.insert(tile(10, 1, 2, 1)).await.unwrap();
        cache.insert(tile(11, 1, 1, 1)).await.unwrap();

        assert_eq!(cache.clear_older_than(Duration::hours(24)).await.unwrap(), 1);
        assert_eq!(cache.clear_zoom(10).await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&TileKey::new(11, 1, 1)));
    }

    #[tokio::test]
    async fn test_quota_evicts_oldest() {
        let cache = TileCache::in_memory();
        cache.insert(tile(5, 0, 0, 3)).await.unwrap();
        cache.insert(tile(5, 0, 1, 2)).await.unwrap();
        cache.insert(tile(5, 0, 2, 1)).await.unwrap();

        assert_eq!(cache.enforce_quota(2).await.unwrap(), 1);
        assert!(!cache.has(&TileKey::new(5, 0, 0)));
        assert_eq!(cache.enforce_quota(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_durable_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = TileKey::new(3, 4, 5);
        {
            let cache = TileCache::open(dir.path().to_path_buf()).await.unwrap();
            cache.set(key, vec![9; 8]).await.unwrap();
        }
        assert!(dir.path().join("3/4/5.bin").exists());

        let reopened = TileCache::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get(&key).unwrap().data, vec![9; 8]);

        reopened.clear().await.unwrap();
        assert!(!dir.path().join("3/4/5.bin").exists());
    }
}
