//! Durable offline store.
//!
//! Five tables live under one root directory:
//!
//! ```text
//! <root>/
//!   tiles/<z>/<x>/<y>.bin        TileCache            (bincode)
//!   entities/<type>.json         EntitySnapshotCache  (wholesale per type)
//!   actions/<seq>-<id>.json      ActionQueue          (insertion ordered)
//!   analytics/<key>.json         AnalyticsCache       (TTL, lazy delete)
//!   metadata.json                MetadataStore        (key-value)
//! ```
//!
//! Each table keeps an in-memory mirror loaded at open. Writes are
//! serialized per logical key, written to a temp file and renamed into
//! place, then published to the mirror. A reader can therefore see the
//! previous row until an in-flight write completes, never a torn one.

mod actions;
mod analytics;
mod entities;
mod metadata;
mod persist;
mod tiles;

pub use actions::{ActionKind, ActionQueue, PendingAction};
pub use analytics::{AnalyticsCache, AnalyticsSnapshot, DEFAULT_ANALYTICS_TTL_SECS};
pub use entities::{CachedEntitySnapshot, EntitySnapshotCache};
pub use metadata::{MetadataStore, LAST_SYNC_KEY, SCHEMA_VERSION_KEY};
pub use tiles::{CachedTile, TileCache, TileKey};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::info;

/// Current on-disk layout version.
pub const SCHEMA_VERSION: u32 = 1;

/// Default tile quota.
pub const DEFAULT_MAX_TILES: usize = 5_000;

/// Default tile lifetime, in seconds (seven days).
pub const DEFAULT_TILE_MAX_AGE_SECS: i64 = 7 * 24 * 3_600;

/// Errors from offline store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// Synced actions can only be cleaned up.
    #[error("Action {0} is already synced")]
    ImmutableAction(String),

    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),

    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),
}

/// Store location and retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Root directory; `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
    pub max_tiles: usize,
    pub tile_max_age_secs: i64,
    pub analytics_ttl_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_tiles: DEFAULT_MAX_TILES,
            tile_max_age_secs: DEFAULT_TILE_MAX_AGE_SECS,
            analytics_ttl_secs: DEFAULT_ANALYTICS_TTL_SECS,
        }
    }
}

impl StoreConfig {
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_max_tiles(mut self, max_tiles: usize) -> Self {
        self.max_tiles = max_tiles;
        self
    }

    pub fn with_tile_max_age_secs(mut self, secs: i64) -> Self {
        self.tile_max_age_secs = secs;
        self
    }

    pub fn with_analytics_ttl_secs(mut self, secs: i64) -> Self {
        self.analytics_ttl_secs = secs;
        self
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tiles: usize,
    pub tile_bytes: u64,
    pub entity_types: usize,
    pub actions_pending: usize,
    pub actions_total: usize,
    pub analytics: usize,
    pub metadata_keys: usize,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tiles:        {} ({} bytes)", self.tiles, self.tile_bytes)?;
        writeln!(f, "entity types: {}", self.entity_types)?;
        writeln!(
            f,
            "actions:      {} pending / {} total",
            self.actions_pending, self.actions_total
        )?;
        writeln!(f, "analytics:    {}", self.analytics)?;
        write!(f, "metadata:     {}", self.metadata_keys)
    }
}

/// What a maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tiles_expired: usize,
    pub tiles_over_quota: usize,
    pub analytics_expired: usize,
    pub actions_cleared: usize,
}

#[derive(Debug)]
struct Tables {
    tiles: TileCache,
    entities: EntitySnapshotCache,
    actions: ActionQueue,
    analytics: AnalyticsCache,
    metadata: MetadataStore,
}

/// Handle to the five offline tables. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OfflineStore {
    config: StoreConfig,
    tables: Arc<Tables>,
}

impl OfflineStore {
    /// Open (or create) a durable store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(&StoreConfig::default().with_dir(dir.as_ref())).await
    }

    pub async fn open_with(config: &StoreConfig) -> Result<Self, StoreError> {
        let Some(root) = config.dir.clone() else {
            return Ok(Self::in_memory_with(config));
        };
        tokio::fs::create_dir_all(&root).await?;

        let analytics_ttl = chrono::Duration::seconds(config.analytics_ttl_secs);
        let tables = Tables {
            tiles: TileCache::open(root.join("tiles")).await?,
            entities: EntitySnapshotCache::open(root.join("entities")).await?,
            actions: ActionQueue::open(root.join("actions")).await?,
            analytics: AnalyticsCache::open(root.join("analytics"), analytics_ttl).await?,
            metadata: MetadataStore::open(root.join("metadata.json")).await?,
        };
        if tables.metadata.get(SCHEMA_VERSION_KEY).is_none() {
            tables
                .metadata
                .set(SCHEMA_VERSION_KEY, json!(SCHEMA_VERSION))
                .await?;
        }

        info!(
            dir = %root.display(),
            tiles = tables.tiles.len(),
            pending_actions = tables.actions.pending_count(),
            "Offline store opened"
        );
        Ok(Self {
            config: config.clone(),
            tables: Arc::new(tables),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::in_memory_with(&StoreConfig::default())
    }

    fn in_memory_with(config: &StoreConfig) -> Self {
        let tables = Tables {
            tiles: TileCache::in_memory(),
            entities: EntitySnapshotCache::in_memory(),
            actions: ActionQueue::in_memory(),
            analytics: AnalyticsCache::in_memory(chrono::Duration::seconds(
                config.analytics_ttl_secs,
            )),
            metadata: MetadataStore::in_memory(),
        };
        Self {
            config: StoreConfig {
                dir: None,
                ..config.clone()
            },
            tables: Arc::new(tables),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.config.dir.is_some()
    }

    pub fn tiles(&self) -> &TileCache {
        &self.tables.tiles
    }

    pub fn entities(&self) -> &EntitySnapshotCache {
        &self.tables.entities
    }

    pub fn actions(&self) -> &ActionQueue {
        &self.tables.actions
    }

    pub fn analytics(&self) -> &AnalyticsCache {
        &self.tables.analytics
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.tables.metadata
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            tiles: self.tables.tiles.len(),
            tile_bytes: self.tables.tiles.total_bytes(),
            entity_types: self.tables.entities.len(),
            actions_pending: self.tables.actions.pending_count(),
            actions_total: self.tables.actions.len(),
            analytics: self.tables.analytics.len(),
            metadata_keys: self.tables.metadata.keys().len(),
        }
    }

    /// Apply the retention policy to every table.
    pub async fn maintain(&self) -> Result<MaintenanceReport, StoreError> {
        let max_age = chrono::Duration::seconds(self.config.tile_max_age_secs);
        let report = MaintenanceReport {
            tiles_expired: self.tables.tiles.clear_older_than(max_age).await?,
            tiles_over_quota: self.enforce_tile_quota(self.config.max_tiles).await?,
            analytics_expired: self.tables.analytics.purge_expired().await?,
            actions_cleared: self.tables.actions.clear_synced().await?,
        };
        info!(?report, "Store maintenance complete");
        Ok(report)
    }

    pub async fn enforce_tile_quota(&self, max_tiles: usize) -> Result<usize, StoreError> {
        self.tables.tiles.enforce_quota(max_tiles).await
    }
}
