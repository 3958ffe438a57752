//! Layer registry: mounted layers, their last-known data, and their queues.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::queue::{
    EnqueueOutcome, LayerQueue, QueueMetrics, UpdatePayload, UpdateQueueEntry,
};
use super::spec::{ApplyMode, LayerKind, LayerSpec};
use crate::entities::UpdateBatch;
use crate::geo::FeatureCollection;
use crate::runtime::{EngineError, RenderEngine};

/// A registered layer and the data last applied to it.
///
/// The data outlives any engine instance; it is what gets re-mounted after
/// reattachment.
#[derive(Debug, Clone)]
pub struct LayerHandle {
    pub spec: LayerSpec,
    pub visible: bool,
    pub data: FeatureCollection,
    /// Bumped on every flush that changes `data`.
    pub data_version: u64,
}

impl LayerHandle {
    fn new(spec: LayerSpec) -> Self {
        Self {
            visible: spec.visible,
            spec,
            data: FeatureCollection::new(),
            data_version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn kind(&self) -> LayerKind {
        self.spec.kind
    }
}

/// What the engine needs to mount one layer.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub spec: LayerSpec,
    pub visible: bool,
    pub data: FeatureCollection,
}

/// Per-layer queue counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetrics {
    pub layer_id: String,
    pub enqueued: u64,
    pub dropped: u64,
    pub coalesced: u64,
    pub flushed: u64,
    pub cleared: u64,
    pub pending: usize,
}

impl LayerMetrics {
    fn from_queue(layer_id: &str, m: QueueMetrics, pending: usize) -> Self {
        Self {
            layer_id: layer_id.to_string(),
            enqueued: m.enqueued,
            dropped: m.dropped,
            coalesced: m.coalesced,
            flushed: m.flushed,
            cleared: m.cleared,
            pending,
        }
    }
}

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Queue entries applied.
    pub applied: usize,
    /// Layers whose data changed, in mount order.
    pub layers: Vec<String>,
    /// True if the changes were pushed to an engine in one frame.
    pub rendered: bool,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }
}

#[derive(Debug)]
struct LayerSlot {
    handle: LayerHandle,
    queue: LayerQueue,
}

/// Ordered set of layers.
///
/// Slots are kept sorted by [`super::LayerGroup`] (stable within a group), so
/// iteration order is mount order.
#[derive(Debug)]
pub struct LayerRegistry {
    slots: Vec<LayerSlot>,
    max_queue_len: usize,
}

impl LayerRegistry {
    pub fn new(max_queue_len: usize) -> Self {
        Self {
            slots: Vec::new(),
            max_queue_len,
        }
    }

    /// Build a registry from a list of specs. Duplicate ids are ignored.
    pub fn with_specs(specs: impl IntoIterator<Item = LayerSpec>, max_queue_len: usize) -> Self {
        let mut registry = Self::new(max_queue_len);
        for spec in specs {
            registry.register(spec);
        }
        registry
    }

    /// Register a layer. Returns false if the id is already taken.
    pub fn register(&mut self, spec: LayerSpec) -> bool {
        if self.slots.iter().any(|s| s.handle.spec.id == spec.id) {
            warn!(layer = %spec.id, "Duplicate layer id ignored");
            return false;
        }
        let queue = LayerQueue::new(spec.id.clone(), self.max_queue_len, spec.policy);
        self.slots.push(LayerSlot {
            handle: LayerHandle::new(spec),
            queue,
        });
        self.slots.sort_by_key(|s| s.handle.spec.group);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Layer ids in mount order.
    pub fn layer_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.handle.spec.id.clone()).collect()
    }

    pub fn handle(&self, layer_id: &str) -> Option<&LayerHandle> {
        self.slots
            .iter()
            .find(|s| s.handle.spec.id == layer_id)
            .map(|s| &s.handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &LayerHandle> {
        self.slots.iter().map(|s| &s.handle)
    }

    /// Snapshot of every layer for mounting on a fresh engine.
    pub fn mount_entries(&self) -> Vec<MountEntry> {
        self.slots
            .iter()
            .map(|s| MountEntry {
                spec: s.handle.spec.clone(),
                visible: s.handle.visible,
                data: s.handle.data.clone(),
            })
            .collect()
    }

    /// Enqueue every collection present in the batch onto the layers that
    /// render it. Returns the number of entries pushed.
    ///
    /// Overflow is logged and counted; it never fails the call.
    pub fn enqueue_batch(&mut self, batch: &UpdateBatch) -> usize {
        let mut pushed = 0;

        for collection in batch.collections() {
            let Some(features) = batch.features_for(collection) else {
                continue;
            };

            for slot in self.slots.iter_mut().filter(|s| s.handle.spec.source == collection) {
                let layer_id = slot.handle.spec.id.clone();
                let entries: Vec<UpdateQueueEntry> = match slot.handle.spec.apply {
                    ApplyMode::Upsert => features
                        .iter()
                        .cloned()
                        .map(|f| UpdateQueueEntry::feature(layer_id.clone(), f))
                        .collect(),
                    ApplyMode::Replace => {
                        vec![UpdateQueueEntry::collection(layer_id.clone(), features.clone())]
                    }
                };

                for entry in entries {
                    pushed += 1;
                    if let EnqueueOutcome::Overflowed(overflow) = slot.queue.push(entry) {
                        warn!(
                            layer = %overflow.layer,
                            max_len = overflow.max_len,
                            dropped_sequence = overflow.dropped_sequence,
                            dropped = slot.queue.metrics().dropped,
                            "Layer queue overflow, dropped oldest entry"
                        );
                    }
                }
            }
        }

        pushed
    }

    /// Total queued entries across layers.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(|s| s.queue.len()).sum()
    }

    /// Discard all queued entries. Layer data is kept.
    pub fn clear_queues(&mut self) -> usize {
        self.slots.iter_mut().map(|s| s.queue.clear()).sum()
    }

    /// Drain every queue in mount order and apply the entries.
    ///
    /// With an engine, all changed layers are pushed between one
    /// `begin_frame`/`commit_frame` pair. Without one (detached), entries
    /// are only folded into the layers' last-known data.
    pub fn flush(
        &mut self,
        engine: Option<&mut (dyn RenderEngine + '_)>,
    ) -> Result<FlushReport, EngineError> {
        let mut report = FlushReport::default();

        for slot in &mut self.slots {
            let entries = slot.queue.drain();
            if entries.is_empty() {
                continue;
            }
            report.applied += entries.len();

            for entry in entries {
                match entry.payload {
                    UpdatePayload::Feature(feature) => {
                        slot.handle.data.upsert(feature);
                    }
                    UpdatePayload::Collection(collection) => {
                        slot.handle.data = collection;
                    }
                }
            }
            slot.handle.data_version += 1;
            report.layers.push(slot.handle.spec.id.clone());
        }

        let Some(engine) = engine else {
            if !report.is_empty() {
                debug!(applied = report.applied, "Flush folded into detached layer data");
            }
            return Ok(report);
        };

        if report.layers.is_empty() {
            return Ok(report);
        }

        let touched: HashSet<&str> = report.layers.iter().map(String::as_str).collect();
        engine.begin_frame();
        for slot in self.slots.iter().filter(|s| touched.contains(s.handle.spec.id.as_str())) {
            engine.set_layer_data(&slot.handle.spec.id, &slot.handle.data)?;
        }
        engine.commit_frame()?;
        report.rendered = true;

        Ok(report)
    }

    /// Record a visibility change. Returns false for an unknown layer.
    pub fn set_visibility(&mut self, layer_id: &str, visible: bool) -> bool {
        match self.slots.iter_mut().find(|s| s.handle.spec.id == layer_id) {
            Some(slot) => {
                slot.handle.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Per-layer queue metrics in mount order.
    pub fn metrics(&self) -> Vec<LayerMetrics> {
        self.slots
            .iter()
            .map(|s| LayerMetrics::from_queue(&s.handle.spec.id, s.queue.metrics(), s.queue.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Alert, AlertSeverity, Vehicle, VehicleStatus};
    use crate::geo::{Geometry, LngLat};
    use crate::layers::{default_layer_specs, LayerGroup};
    use crate::runtime::HeadlessEngine;
    use chrono::Utc;

    fn vehicle(id: &str, lng: f64) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: id.to_string(),
            position: Some(LngLat::new(lng, 53.0)),
            heading: 0.0,
            speed_kmh: 40.0,
            status: VehicleStatus::Moving,
            capacity_total: 100,
            capacity_remaining: 100,
            route_id: None,
        }
    }

    fn alert(id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            message: format!("alert {}", id),
            severity: AlertSeverity::Warning,
            position: Some(LngLat::new(10.0, 53.0)),
            vehicle_id: None,
            raised_at: Utc::now(),
        }
    }

    fn point_lng(data: &FeatureCollection, id: &str) -> f64 {
        match data.get(id).map(|f| &f.geometry) {
            Some(Geometry::Point { coordinates }) => coordinates[0],
            other => panic!("expected point for {}, got {:?}", id, other),
        }
    }

    #[test]
    fn test_slots_sorted_by_group() {
        let mut specs = default_layer_specs();
        specs.reverse();
        let registry = LayerRegistry::with_specs(specs, 100);

        let groups: Vec<LayerGroup> = registry.handles().map(|h| h.spec.group).collect();
        assert!(groups.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(registry.layer_ids().first().map(String::as_str), Some("warehouses"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        let before = registry.len();
        let dup = default_layer_specs().remove(0);
        assert!(!registry.register(dup));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_same_entity_coalesces_before_flush() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        for i in 0..5 {
            registry.enqueue_batch(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", f64::from(i))]));
        }

        let report = registry.flush(None).unwrap();
        // "vehicles" and "vehicle-density" both render vehicles
        assert_eq!(report.applied, 2);
        let data = &registry.handle("vehicles").unwrap().data;
        assert_eq!(data.len(), 1);
        assert_eq!(point_lng(data, "v1"), 4.0);
    }

    #[test]
    fn test_distinct_alerts_apply_in_order() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        let alerts: Vec<Alert> = (0..5).map(|i| alert(&format!("a{}", i))).collect();
        registry.enqueue_batch(&UpdateBatch::live().with_alerts(alerts));

        let report = registry.flush(None).unwrap();
        assert_eq!(report.applied, 5);
        let ids: Vec<_> = registry
            .handle("alerts")
            .unwrap()
            .data
            .iter()
            .map(|f| f.id.clone())
            .collect();
        assert_eq!(ids, vec!["a0", "a1", "a2", "a3", "a4"]);
    }

    #[test]
    fn test_absent_collections_untouched() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        registry.enqueue_batch(&UpdateBatch::live().with_alerts(vec![alert("a1")]));
        registry.flush(None).unwrap();

        registry.enqueue_batch(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 1.0)]));
        let report = registry.flush(None).unwrap();

        assert!(!report.layers.contains(&"alerts".to_string()));
        assert_eq!(registry.handle("alerts").unwrap().data.len(), 1);
    }

    #[test]
    fn test_flush_renders_one_frame() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        let mut engine = HeadlessEngine::new("test", Default::default());

        registry.enqueue_batch(
            &UpdateBatch::live()
                .with_vehicles(vec![vehicle("v1", 1.0)])
                .with_alerts(vec![alert("a1")]),
        );
        let report = registry.flush(Some(&mut engine)).unwrap();

        assert!(report.rendered);
        assert_eq!(engine.frames_committed(), 1);
        assert!(engine.layer_data("vehicles").is_some());
        assert!(engine.layer_data("alerts").is_some());
    }

    #[test]
    fn test_empty_flush_skips_frame() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        let mut engine = HeadlessEngine::new("test", Default::default());

        let report = registry.flush(Some(&mut engine)).unwrap();
        assert!(report.is_empty());
        assert!(!report.rendered);
        assert_eq!(engine.frames_committed(), 0);
    }

    #[test]
    fn test_replace_layer_takes_whole_collection() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        let route = |id: &str| crate::entities::Route {
            id: id.to_string(),
            name: id.to_string(),
            status: crate::entities::RouteStatus::Active,
            path: vec![LngLat::new(10.0, 53.0), LngLat::new(10.1, 53.1)],
        };

        registry.enqueue_batch(&UpdateBatch::live().with_routes(vec![route("r1"), route("r2")]));
        registry.flush(None).unwrap();
        registry.enqueue_batch(&UpdateBatch::live().with_routes(vec![route("r3")]));
        registry.flush(None).unwrap();

        let data = &registry.handle("routes").unwrap().data;
        assert_eq!(data.len(), 1);
        assert!(data.get("r3").is_some());
        assert_eq!(registry.handle("routes").unwrap().data_version, 2);
    }

    #[test]
    fn test_clear_queues_keeps_data() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        registry.enqueue_batch(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 1.0)]));
        registry.flush(None).unwrap();
        registry.enqueue_batch(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 2.0)]));

        assert_eq!(registry.clear_queues(), 2);
        assert_eq!(registry.pending(), 0);
        assert_eq!(point_lng(&registry.handle("vehicles").unwrap().data, "v1"), 1.0);
    }

    #[test]
    fn test_metrics_report_overflow() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 3);
        let alerts: Vec<Alert> = (0..5).map(|i| alert(&format!("a{}", i))).collect();
        registry.enqueue_batch(&UpdateBatch::live().with_alerts(alerts));

        let metrics = registry.metrics();
        let alerts = metrics.iter().find(|m| m.layer_id == "alerts").unwrap();
        assert_eq!(alerts.enqueued, 5);
        assert_eq!(alerts.dropped, 2);
        assert_eq!(alerts.pending, 3);
    }

    #[test]
    fn test_visibility_unknown_layer() {
        let mut registry = LayerRegistry::with_specs(default_layer_specs(), 100);
        assert!(registry.set_visibility("vehicle-density", true));
        assert!(registry.handle("vehicle-density").unwrap().visible);
        assert!(!registry.set_visibility("nope", true));
    }
}
