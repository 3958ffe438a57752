//! Control signals from the host platform.
//!
//! An installable host (manifest plus background worker) sends a handful of
//! control signals into the core. The core only receives them; how the
//! platform produces them is the host's business.
//!
//! ```text
//! host worker ──ControlSignal──► PlatformBridge ─┬─► OfflineStore (cache/clear)
//!                                                ├─► SyncQueueManager (background sync)
//!                                                └─► MapRuntime handlers (activate)
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::MapRuntime;
use crate::store::{CachedTile, OfflineStore, StoreError};
use crate::sync::SyncQueueManager;

/// Default capacity of the signal channel.
pub const DEFAULT_SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// A signal from the host platform.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// Tiles the worker fetched ahead of time.
    CacheTiles(Vec<CachedTile>),
    /// Drop cached tiles, snapshots and analytics. Pending actions stay.
    ClearCache,
    /// A new host version is ready and wants to take over now.
    ActivateNow,
    /// The platform granted a background sync slot.
    BackgroundSync,
}

impl ControlSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ControlSignal::CacheTiles(_) => "cache-tiles",
            ControlSignal::ClearCache => "clear-cache",
            ControlSignal::ActivateNow => "activate-now",
            ControlSignal::BackgroundSync => "background-sync",
        }
    }
}

/// What handling a signal did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    pub tiles_cached: usize,
    pub tiles_evicted: usize,
    pub rows_cleared: usize,
    pub sync_requested: bool,
    pub forwarded: bool,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Routes control signals to the components that act on them.
pub struct PlatformBridge {
    store: OfflineStore,
    sync: Option<Arc<SyncQueueManager>>,
    runtime: Option<Arc<MapRuntime>>,
}

impl PlatformBridge {
    pub fn new(store: OfflineStore) -> Self {
        Self {
            store,
            sync: None,
            runtime: None,
        }
    }

    pub fn with_sync(mut self, sync: Arc<SyncQueueManager>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<MapRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Channel for the host to send signals into [`run`](Self::run).
    pub fn channel() -> (mpsc::Sender<ControlSignal>, mpsc::Receiver<ControlSignal>) {
        mpsc::channel(DEFAULT_SIGNAL_CHANNEL_CAPACITY)
    }

    pub async fn handle(&self, signal: ControlSignal) -> Result<SignalOutcome, PlatformError> {
        debug!(signal = signal.name(), "Control signal received");
        let mut outcome = SignalOutcome::default();

        match signal {
            ControlSignal::CacheTiles(tiles) => {
                for tile in tiles {
                    self.store.tiles().insert(tile).await?;
                    outcome.tiles_cached += 1;
                }
                outcome.tiles_evicted = self
                    .store
                    .enforce_tile_quota(self.store.config().max_tiles)
                    .await?;
                info!(
                    cached = outcome.tiles_cached,
                    evicted = outcome.tiles_evicted,
                    "Tiles cached from platform"
                );
            }
            ControlSignal::ClearCache => {
                outcome.rows_cleared = self.store.tiles().clear().await?
                    + self.store.entities().clear().await?
                    + self.store.analytics().clear().await?;
                info!(rows = outcome.rows_cleared, "Cache cleared by platform");
            }
            ControlSignal::BackgroundSync => match &self.sync {
                Some(sync) => {
                    sync.request_sync();
                    outcome.sync_requested = true;
                }
                None => debug!("Background sync signal without a sync queue"),
            },
            ControlSignal::ActivateNow => match &self.runtime {
                Some(runtime) => {
                    runtime.notify_control_signal(ControlSignal::ActivateNow);
                    outcome.forwarded = true;
                }
                None => debug!("Activate signal without a runtime"),
            },
        }
        Ok(outcome)
    }

    /// Handle signals until the channel closes or `cancel` fires.
    pub async fn run(self, mut rx: mpsc::Receiver<ControlSignal>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => {
                    let Some(signal) = signal else { break };
                    let name = signal.name();
                    if let Err(e) = self.handle(signal).await {
                        warn!(signal = name, error = %e, "Control signal failed");
                    }
                }
            }
        }
        debug!("Platform bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Container, HeadlessEngineFactory, RuntimeConfig, RuntimeHandlers};
    use crate::store::{ActionKind, StoreConfig, TileKey};
    use crate::sync::{NetworkState, SyncConfig};
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;

    fn tile(z: u8, x: u32) -> CachedTile {
        CachedTile {
            key: TileKey::new(z, x, 0),
            data: vec![z; 4],
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cache_tiles_respects_quota() {
        let store = OfflineStore::open_with(&StoreConfig::default().with_max_tiles(2))
            .await
            .unwrap();
        let bridge = PlatformBridge::new(store.clone());

        let outcome = bridge
            .handle(ControlSignal::CacheTiles(vec![tile(10, 1), tile(10, 2), tile(10, 3)]))
            .await
            .unwrap();
        assert_eq!(outcome.tiles_cached, 3);
        assert_eq!(outcome.tiles_evicted, 1);
        assert_eq!(store.tiles().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_pending_actions() {
        let store = OfflineStore::in_memory();
        store.tiles().insert(tile(12, 1)).await.unwrap();
        store.entities().put("vehicles", &[json!({"id": "v1"})]).await.unwrap();
        store
            .actions()
            .enqueue(ActionKind::LogFuel, json!({"liters": 40}), None)
            .await
            .unwrap();

        let outcome = PlatformBridge::new(store.clone())
            .handle(ControlSignal::ClearCache)
            .await
            .unwrap();
        assert_eq!(outcome.rows_cleared, 2);
        assert!(store.tiles().is_empty());
        assert_eq!(store.actions().pending_count(), 1);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ControlSignal>>);

    impl RuntimeHandlers for Recorder {
        fn on_control_signal(&self, signal: &ControlSignal) {
            self.0.lock().push(signal.clone());
        }
    }

    #[tokio::test]
    async fn test_run_routes_signals() {
        let store = OfflineStore::in_memory();
        let runtime = Arc::new(MapRuntime::new(Arc::new(HeadlessEngineFactory::new())));
        let recorder = Arc::new(Recorder::default());
        runtime
            .init(Container::new("main"), RuntimeConfig::default(), recorder.clone())
            .await
            .unwrap();
        let sync = Arc::new(SyncQueueManager::new(
            store.clone(),
            Arc::new(crate::sync::HttpMutationClient::new("http://localhost:1").unwrap()),
            Arc::new(NetworkState::new(false)),
            SyncConfig::default(),
        ));

        let bridge = PlatformBridge::new(store)
            .with_sync(sync)
            .with_runtime(runtime);
        let outcome = bridge.handle(ControlSignal::BackgroundSync).await.unwrap();
        assert!(outcome.sync_requested);

        let (tx, rx) = PlatformBridge::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(rx, cancel.clone()));
        tx.send(ControlSignal::ActivateNow).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(*recorder.0.lock(), vec![ControlSignal::ActivateNow]);
    }
}
