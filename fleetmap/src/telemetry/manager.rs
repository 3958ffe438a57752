//! Registry of running telemetry adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::adapter::{SourceHandle, TelemetryAdapter, TelemetrySourceStatus};
use super::source::RealtimeSource;
use super::{TelemetryEntity, TelemetryError};

struct Registration {
    handle: SourceHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Named adapters, each on its own task.
///
/// Cancelling the manager's root token (through [`destroy_all`]) stops
/// every adapter at once.
///
/// [`destroy_all`]: TelemetryManager::destroy_all
pub struct TelemetryManager {
    root: CancellationToken,
    sources: Mutex<BTreeMap<String, Registration>>,
}

impl Default for TelemetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run `adapter` over an existing delta stream.
    pub fn register<E: TelemetryEntity>(
        &self,
        adapter: TelemetryAdapter<E>,
        rx: mpsc::Receiver<Vec<E>>,
    ) -> Result<SourceHandle, TelemetryError> {
        self.spawn_registered(adapter, move |adapter, cancel| adapter.run(rx, cancel))
    }

    /// Hydrate from the offline store, load the source's snapshot, then
    /// follow its delta stream.
    pub fn spawn_source<E: TelemetryEntity>(
        &self,
        adapter: TelemetryAdapter<E>,
        source: Arc<dyn RealtimeSource<E>>,
    ) -> Result<SourceHandle, TelemetryError> {
        self.spawn_registered(adapter, move |mut adapter, cancel| async move {
            if let Err(e) = adapter.hydrate().await {
                warn!(source = %adapter.id(), error = %e, "Hydration failed");
            }
            let rx = source.subscribe();
            tokio::select! {
                _ = cancel.cancelled() => return,
                loaded = adapter.load_initial(&*source) => {
                    if let Err(e) = loaded {
                        warn!(source = %adapter.id(), error = %e, "Initial snapshot failed");
                    }
                }
            }
            adapter.run(rx, cancel).await;
        })
    }

    fn spawn_registered<E, F, Fut>(
        &self,
        adapter: TelemetryAdapter<E>,
        body: F,
    ) -> Result<SourceHandle, TelemetryError>
    where
        E: TelemetryEntity,
        F: FnOnce(TelemetryAdapter<E>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut sources = self.sources.lock();
        let id = adapter.id().to_string();
        if sources.contains_key(&id) {
            return Err(TelemetryError::DuplicateSource(id));
        }

        let handle = adapter.handle();
        let cancel = self.root.child_token();
        let task = tokio::spawn(body(adapter, cancel.clone()));
        sources.insert(
            id.clone(),
            Registration {
                handle: handle.clone(),
                cancel,
                task,
            },
        );
        debug!(source = %id, "Telemetry source registered");
        Ok(handle)
    }

    /// Stop and forget one source. Returns false when it was not registered.
    pub fn unregister(&self, id: &str) -> bool {
        match self.sources.lock().remove(id) {
            Some(registration) => {
                registration.cancel.cancel();
                debug!(source = %id, "Telemetry source unregistered");
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }

    pub fn status(&self, id: &str) -> Option<TelemetrySourceStatus> {
        self.sources.lock().get(id).map(|r| r.handle.status())
    }

    pub fn statuses(&self) -> Vec<TelemetrySourceStatus> {
        self.sources
            .lock()
            .values()
            .map(|r| r.handle.status())
            .collect()
    }

    /// Stop every source and wait for their tasks to finish.
    pub async fn destroy_all(&self) {
        self.root.cancel();
        let registrations: Vec<(String, Registration)> =
            std::mem::take(&mut *self.sources.lock()).into_iter().collect();
        let count = registrations.len();
        for (id, registration) in registrations {
            if let Err(e) = registration.task.await {
                warn!(source = %id, error = %e, "Telemetry task ended abnormally");
            }
        }
        info!(sources = count, "Telemetry sources destroyed");
    }
}

impl Drop for TelemetryManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
