//! Per-source telemetry adapter.
//!
//! The adapter owns its timer state explicitly: the debounce deadline and
//! the next animation frame. The run loop sleeps until the earlier of the
//! two, so there are no callbacks holding stale state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::{Debouncer, FAST_DEBOUNCE, TOPOLOGY_DEBOUNCE};
use super::smoothing::{PositionSmoother, SmoothingConfig, SmoothingDecision};
use super::source::RealtimeSource;
use super::{TelemetryEntity, TelemetryError};
use crate::entities::{EntityCollection, UpdateOrigin};
use crate::runtime::{RuntimeError, UpdateSink, DEFAULT_FRAME_INTERVAL};
use crate::store::OfflineStore;

/// Settings for one telemetry source.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySourceConfig {
    pub id: String,
    pub debounce: Duration,
    /// `None` applies positions directly.
    pub smoothing: Option<SmoothingConfig>,
    /// Interval between animation frames while entities are easing.
    pub frame_interval: Duration,
    /// Write the latest snapshot through to the offline store.
    pub persist: bool,
}

impl TelemetrySourceConfig {
    /// Preset for fast-moving entities: short debounce, smoothing on.
    pub fn fast(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            debounce: FAST_DEBOUNCE,
            smoothing: Some(SmoothingConfig::default()),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            persist: true,
        }
    }

    /// Preset for near-static topology: long debounce, no smoothing.
    pub fn topology(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            debounce: TOPOLOGY_DEBOUNCE,
            smoothing: None,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            persist: true,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_smoothing(mut self, smoothing: Option<SmoothingConfig>) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// Counters for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Entities received from the source, before debouncing.
    pub received: u64,
    /// Batches accepted by the sink.
    pub batches_submitted: u64,
    /// Animation frames accepted by the sink.
    pub frames: u64,
    /// Batches refused by the sink.
    pub rejected: u64,
    pub snaps: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

/// Point-in-time view of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySourceStatus {
    pub id: String,
    pub collection: EntityCollection,
    pub debounce: Duration,
    pub smoothing: bool,
    pub pending: usize,
    pub tracked: usize,
    pub animating: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub stats: TelemetryStats,
}

/// Shared read handle to an adapter's status, valid after it is moved into
/// its run loop.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    id: String,
    status: Arc<Mutex<TelemetrySourceStatus>>,
}

impl SourceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TelemetrySourceStatus {
        self.status.lock().clone()
    }
}

/// Debounce, smooth and forward one entity stream.
pub struct TelemetryAdapter<E: TelemetryEntity> {
    config: TelemetrySourceConfig,
    sink: Arc<dyn UpdateSink>,
    store: Option<OfflineStore>,
    debouncer: Debouncer<E>,
    smoother: Option<PositionSmoother>,
    /// Last reported (target) state per entity.
    latest: BTreeMap<String, E>,
    next_frame: Option<Instant>,
    stats: TelemetryStats,
    last_update: Option<DateTime<Utc>>,
    status: Arc<Mutex<TelemetrySourceStatus>>,
}

impl<E: TelemetryEntity> TelemetryAdapter<E> {
    pub fn new(config: TelemetrySourceConfig, sink: Arc<dyn UpdateSink>) -> Self {
        let status = TelemetrySourceStatus {
            id: config.id.clone(),
            collection: E::COLLECTION,
            debounce: config.debounce,
            smoothing: config.smoothing.is_some(),
            pending: 0,
            tracked: 0,
            animating: false,
            last_update: None,
            stats: TelemetryStats::default(),
        };
        Self {
            debouncer: Debouncer::new(config.debounce),
            smoother: config.smoothing.map(PositionSmoother::new),
            config,
            sink,
            store: None,
            latest: BTreeMap::new(),
            next_frame: None,
            stats: TelemetryStats::default(),
            last_update: None,
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn with_store(mut self, store: OfflineStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TelemetrySourceConfig {
        &self.config
    }

    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
            id: self.config.id.clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn stats(&self) -> &TelemetryStats {
        &self.stats
    }

    pub fn status(&self) -> TelemetrySourceStatus {
        self.status.lock().clone()
    }

    /// Last reported state of one entity.
    pub fn latest(&self, id: &str) -> Option<&E> {
        self.latest.get(id)
    }

    /// Accept a delta; restarts the debounce window.
    pub fn ingest(&mut self, items: Vec<E>, now: Instant) {
        self.stats.received += items.len() as u64;
        self.debouncer.push(items, now);
        self.publish_status();
    }

    /// When the adapter next needs [`on_timer`](Self::on_timer).
    pub fn next_wake(&self) -> Option<Instant> {
        match (self.debouncer.deadline(), self.next_frame) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whatever is due: the debounced batch or an animation frame.
    /// Returns the number of entities submitted.
    pub async fn on_timer(&mut self, now: Instant) -> usize {
        if let Some(items) = self.debouncer.take_if_due(now) {
            return self.apply(items, UpdateOrigin::Live, now, true).await;
        }
        if self.next_frame.is_some_and(|t| now >= t) {
            return self.emit_frame(now);
        }
        0
    }

    /// Apply anything still waiting in the debouncer.
    pub async fn flush_pending(&mut self, now: Instant) -> usize {
        let items = self.debouncer.take();
        if items.is_empty() {
            return 0;
        }
        self.apply(items, UpdateOrigin::Live, now, true).await
    }

    /// Replay the persisted snapshot so the map shows last-known state
    /// before the source answers.
    pub async fn hydrate(&mut self) -> Result<usize, TelemetryError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(items) = store.entities().get_as::<E>(E::COLLECTION.as_str())? else {
            return Ok(0);
        };
        debug!(source = %self.config.id, count = items.len(), "Hydrating from offline store");
        Ok(self
            .apply(items, UpdateOrigin::Snapshot, Instant::now(), false)
            .await)
    }

    /// Fetch and apply the source's full snapshot, replacing known state.
    pub async fn load_initial(
        &mut self,
        source: &dyn RealtimeSource<E>,
    ) -> Result<usize, TelemetryError> {
        let items = source.snapshot().await?;
        self.latest.clear();
        Ok(self
            .apply(items, UpdateOrigin::Snapshot, Instant::now(), true)
            .await)
    }

    /// Drive the adapter until cancelled or the stream closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<E>>, cancel: CancellationToken) {
        info!(source = %self.config.id, collection = %E::COLLECTION, "Telemetry source started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(items) => self.ingest(items, Instant::now()),
                    None => {
                        self.flush_pending(Instant::now()).await;
                        break;
                    }
                },
                _ = sleep_until_opt(wake) => {
                    self.on_timer(Instant::now()).await;
                }
            }
        }
        info!(source = %self.config.id, "Telemetry source stopped");
    }

    async fn apply(&mut self, items: Vec<E>, origin: UpdateOrigin, now: Instant, persist: bool) -> usize {
        let mut drawn = Vec::with_capacity(items.len());
        for item in items {
            let id = item.entity_id().to_string();
            let out = match (self.smoother.as_mut(), item.position()) {
                (Some(smoother), Some(target)) => {
                    if smoother.target(&id, target, now) == SmoothingDecision::Snap {
                        self.stats.snaps += 1;
                        debug!(source = %self.config.id, entity = %id, "Position jump snapped");
                    }
                    let at = smoother.position_at(&id, now).unwrap_or(target);
                    item.with_position(at)
                }
                _ => item.clone(),
            };
            self.latest.insert(id, item);
            drawn.push(out);
        }

        let count = drawn.len();
        if self.submit(drawn, origin) {
            self.stats.batches_submitted += 1;
            self.last_update = Some(Utc::now());
        }
        self.schedule_frame(now);
        if persist {
            self.persist().await;
        }
        self.publish_status();
        count
    }

    fn emit_frame(&mut self, now: Instant) -> usize {
        let Some(smoother) = self.smoother.as_mut() else {
            self.next_frame = None;
            return 0;
        };
        let frame: Vec<E> = smoother
            .advance(now)
            .into_iter()
            .filter_map(|(id, at)| self.latest.get(&id).map(|e| e.with_position(at)))
            .collect();

        let count = frame.len();
        if count > 0 && self.submit(frame, UpdateOrigin::Live) {
            self.stats.frames += 1;
        }
        self.schedule_frame(now);
        self.publish_status();
        count
    }

    fn schedule_frame(&mut self, now: Instant) {
        let animating = self.smoother.as_ref().is_some_and(|s| s.is_animating());
        self.next_frame = animating.then(|| now + self.config.frame_interval);
    }

    fn submit(&mut self, items: Vec<E>, origin: UpdateOrigin) -> bool {
        match self.sink.submit(E::into_batch(items, origin)) {
            Ok(_) => true,
            Err(RuntimeError::ModeContractViolation(violation)) => {
                self.stats.rejected += 1;
                debug!(source = %self.config.id, %violation, "Telemetry batch rejected by mode");
                false
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!(source = %self.config.id, error = %e, "Telemetry batch not accepted");
                false
            }
        }
    }

    async fn persist(&mut self) {
        if !self.config.persist {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let snapshot: Vec<E> = self.latest.values().cloned().collect();
        match store.entities().put(E::COLLECTION.as_str(), &snapshot).await {
            Ok(()) => self.stats.persisted += 1,
            Err(e) => {
                self.stats.persist_failures += 1;
                warn!(source = %self.config.id, error = %e, "Snapshot write-through failed");
            }
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.lock();
        status.pending = self.debouncer.pending_len();
        status.tracked = self.latest.len();
        status.animating = self.next_frame.is_some();
        status.last_update = self.last_update;
        status.stats = self.stats.clone();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{UpdateBatch, Vehicle, VehicleStatus};
    use crate::geo::LngLat;
    use crate::runtime::ModeViolation;
    use crate::telemetry::ChannelSource;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<UpdateBatch>>,
        reject: Mutex<bool>,
    }

    impl RecordingSink {
        fn vehicles(&self) -> Vec<Vec<Vehicle>> {
            self.batches
                .lock()
                .iter()
                .filter_map(|b| b.vehicles.clone())
                .collect()
        }
    }

    impl UpdateSink for RecordingSink {
        fn submit(&self, batch: UpdateBatch) -> Result<usize, RuntimeError> {
            if *self.reject.lock() {
                return Err(ModeViolation::MissingTimeRange {
                    mode: "historical-playback",
                }
                .into());
            }
            let n = batch.vehicles.as_ref().map_or(0, Vec::len);
            self.batches.lock().push(batch);
            Ok(n)
        }
    }

    fn vehicle(id: &str, lng: f64) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: id.to_uppercase(),
            position: Some(LngLat::new(lng, 53.55)),
            heading: 90.0,
            speed_kmh: 40.0,
            status: VehicleStatus::Moving,
            capacity_total: 100,
            capacity_remaining: 100,
            route_id: None,
        }
    }

    fn adapter(config: TelemetrySourceConfig) -> (TelemetryAdapter<Vehicle>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (TelemetryAdapter::new(config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_burst_collapses_to_one_submit() {
        let (mut adapter, sink) = adapter(TelemetrySourceConfig::fast("vehicles"));
        let start = Instant::now();
        for i in 0..5u32 {
            adapter.ingest(
                vec![vehicle("v1", 10.0 + f64::from(i) * 0.0001)],
                start + Duration::from_millis(20 * u64::from(i)),
            );
        }

        assert_eq!(adapter.on_timer(start + Duration::from_millis(150)).await, 0);
        assert_eq!(adapter.on_timer(start + Duration::from_millis(180)).await, 1);

        let submitted = sink.vehicles();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0][0].position, vehicle("v1", 10.0 + f64::from(4) * 0.0001).position);
        assert_eq!(adapter.stats().received, 5);
    }

    #[tokio::test]
    async fn test_known_entity_is_eased_not_jumped() {
        let config = TelemetrySourceConfig::fast("vehicles").with_debounce(Duration::ZERO);
        let (mut adapter, sink) = adapter(config);
        let t0 = Instant::now();

        adapter.ingest(vec![vehicle("v1", 10.0)], t0);
        adapter.on_timer(t0).await;
        adapter.ingest(vec![vehicle("v1", 10.001)], t0);
        adapter.on_timer(t0).await;

        // Second submit is drawn where the vehicle was, not at the target
        let submitted = sink.vehicles();
        assert_eq!(submitted[1][0].position.unwrap().lng, 10.0);
        assert_eq!(adapter.latest("v1").unwrap().position.unwrap().lng, 10.001);

        let frame_at = adapter.next_wake().unwrap();
        assert_eq!(frame_at, t0 + DEFAULT_FRAME_INTERVAL);
        adapter.on_timer(frame_at).await;
        let mid = sink.vehicles()[2][0].position.unwrap().lng;
        assert!(mid > 10.0 && mid < 10.001);

        let end = t0 + Duration::from_secs(2);
        adapter.on_timer(end).await;
        assert_eq!(sink.vehicles().last().unwrap()[0].position.unwrap().lng, 10.001);
        assert!(adapter.next_wake().is_none());
    }

    #[tokio::test]
    async fn test_teleport_snaps() {
        let config = TelemetrySourceConfig::fast("vehicles").with_debounce(Duration::ZERO);
        let (mut adapter, sink) = adapter(config);
        let t0 = Instant::now();

        adapter.ingest(vec![vehicle("v1", 10.0)], t0);
        adapter.on_timer(t0).await;
        adapter.ingest(vec![vehicle("v1", 12.0)], t0);
        adapter.on_timer(t0).await;

        assert_eq!(sink.vehicles()[1][0].position.unwrap().lng, 12.0);
        assert_eq!(adapter.stats().snaps, 1);
        assert!(adapter.next_wake().is_none());
    }

    #[tokio::test]
    async fn test_topology_applies_directly() {
        let (mut adapter, sink) = adapter(TelemetrySourceConfig::topology("depots"));
        let t0 = Instant::now();
        adapter.ingest(vec![vehicle("v1", 10.0)], t0);
        adapter.ingest(vec![vehicle("v1", 10.001)], t0);
        adapter.on_timer(t0 + TOPOLOGY_DEBOUNCE).await;
        assert_eq!(sink.vehicles()[0][0].position.unwrap().lng, 10.001);
    }

    #[tokio::test]
    async fn test_rejections_are_counted_not_raised() {
        let (mut adapter, sink) = adapter(TelemetrySourceConfig::fast("vehicles"));
        *sink.reject.lock() = true;
        let t0 = Instant::now();
        adapter.ingest(vec![vehicle("v1", 10.0)], t0);
        adapter.on_timer(t0 + FAST_DEBOUNCE).await;

        assert_eq!(adapter.stats().rejected, 1);
        assert_eq!(adapter.stats().batches_submitted, 0);
        assert_eq!(adapter.handle().status().stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_write_through_and_hydrate() {
        let store = OfflineStore::in_memory();
        let (mut first, _) = adapter(TelemetrySourceConfig::fast("vehicles"));
        first = first.with_store(store.clone());
        let t0 = Instant::now();
        first.ingest(vec![vehicle("v1", 10.0), vehicle("v2", 11.0)], t0);
        first.on_timer(t0 + FAST_DEBOUNCE).await;
        assert_eq!(store.entities().get("vehicles").unwrap().count, 2);

        let (second, sink) = adapter(TelemetrySourceConfig::fast("vehicles"));
        let mut second = second.with_store(store);
        assert_eq!(second.hydrate().await.unwrap(), 2);

        let batch = sink.batches.lock()[0].clone();
        assert_eq!(batch.origin, UpdateOrigin::Snapshot);
        assert_eq!(batch.vehicles.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_initial_replaces_state() {
        let source = ChannelSource::<Vehicle>::new("fleet");
        source.set_snapshot(vec![vehicle("v9", 9.0)]);

        let (mut adapter, sink) = adapter(TelemetrySourceConfig::fast("vehicles"));
        adapter.ingest(vec![vehicle("v1", 10.0)], Instant::now());
        adapter.flush_pending(Instant::now()).await;

        assert_eq!(adapter.load_initial(&*source).await.unwrap(), 1);
        assert!(adapter.latest("v1").is_none());
        assert!(adapter.latest("v9").is_some());
        assert_eq!(sink.batches.lock().last().unwrap().origin, UpdateOrigin::Snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_debounces_channel_input() {
        let (adapter, sink) = adapter(TelemetrySourceConfig::fast("vehicles"));
        let handle = adapter.handle();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(adapter.run(rx, cancel.clone()));

        tx.send(vec![vehicle("v1", 10.0)]).await.unwrap();
        tx.send(vec![vehicle("v1", 10.0001)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.vehicles().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.vehicles().len(), 1);
        assert_eq!(handle.status().stats.received, 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_flushes_pending() {
        let (adapter, sink) = adapter(TelemetrySourceConfig::topology("depots"));
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(adapter.run(rx, CancellationToken::new()));

        tx.send(vec![vehicle("v1", 10.0)]).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(sink.vehicles().len(), 1);
    }
}
