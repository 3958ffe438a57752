//! Bounded per-layer update queue.
//!
//! Entries are kept in FIFO order. Two mechanisms bound growth:
//!
//! 1. **Keep-last coalescing** (for [`QueuePolicy::KeepLastPerKey`] layers):
//!    an entry whose key is already queued replaces the older entry and
//!    moves to the back.
//! 2. **Drop-oldest overflow**: when the queue is full the oldest entry is
//!    evicted whatever its priority. The push itself always succeeds.
//!
//! # Example
//!
//! ```ignore
//! use fleetmap::layers::{LayerQueue, QueuePolicy, UpdateQueueEntry};
//!
//! let mut queue = LayerQueue::new("vehicles", 100, QueuePolicy::KeepLastPerKey);
//! queue.push(UpdateQueueEntry::feature("vehicles", feature_v1_at_t0));
//! queue.push(UpdateQueueEntry::feature("vehicles", feature_v1_at_t1));
//!
//! // Only the newest update for v1 survives
//! assert_eq!(queue.len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use thiserror::Error;

use super::spec::QueuePolicy;
use crate::geo::{Feature, FeatureCollection};

/// Default maximum entries per layer queue.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 100;

// =============================================================================
// Sequence Number Generator
// =============================================================================

/// Global sequence counter for FIFO ordering and overflow diagnostics.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

// =============================================================================
// Entries
// =============================================================================

/// Entry priority. Reported with the entry; overflow eviction is by age
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdatePriority(i32);

impl UpdatePriority {
    /// Full-collection snapshots; outlive bursts of deltas.
    pub const SNAPSHOT: UpdatePriority = UpdatePriority(100);

    /// Incremental per-entity updates.
    pub const DELTA: UpdatePriority = UpdatePriority(0);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i32 {
        self.0
    }
}

/// What an entry carries.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// One feature, merged into the layer by id.
    Feature(Feature),
    /// A whole collection, replacing the layer's data.
    Collection(FeatureCollection),
}

/// A queued layer update.
#[derive(Debug, Clone)]
pub struct UpdateQueueEntry {
    pub layer_id: String,
    pub payload: UpdatePayload,
    pub priority: UpdatePriority,
    pub enqueued_at: Instant,
    /// Entries sharing a key collapse under keep-last coalescing.
    pub coalesce_key: Option<String>,
    sequence: u64,
}

impl UpdateQueueEntry {
    /// Per-feature delta keyed by the feature id.
    pub fn feature(layer_id: impl Into<String>, feature: Feature) -> Self {
        let key = feature.id.clone();
        Self {
            layer_id: layer_id.into(),
            payload: UpdatePayload::Feature(feature),
            priority: UpdatePriority::DELTA,
            enqueued_at: Instant::now(),
            coalesce_key: Some(key),
            sequence: next_sequence(),
        }
    }

    /// Whole-collection replacement.
    pub fn collection(layer_id: impl Into<String>, collection: FeatureCollection) -> Self {
        Self {
            layer_id: layer_id.into(),
            payload: UpdatePayload::Collection(collection),
            priority: UpdatePriority::SNAPSHOT,
            enqueued_at: Instant::now(),
            coalesce_key: None,
            sequence: next_sequence(),
        }
    }

    pub fn with_priority(mut self, priority: UpdatePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn wait_time(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// An entry was evicted to make room. Non-fatal: the push still succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("layer '{layer}' queue full ({max_len}), dropped oldest entry #{dropped_sequence}")]
pub struct QueueOverflow {
    pub layer: String,
    pub max_len: usize,
    pub dropped_sequence: u64,
    pub dropped_key: Option<String>,
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended.
    Accepted,
    /// Replaced a queued entry with the same key.
    Coalesced,
    /// Appended after evicting the oldest entry.
    Overflowed(QueueOverflow),
}

/// Lifetime counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub dropped: u64,
    pub coalesced: u64,
    pub flushed: u64,
    pub cleared: u64,
}

// =============================================================================
// Queue
// =============================================================================

/// Bounded FIFO for one layer.
///
/// Not thread-safe; the runtime wraps it in its state mutex.
#[derive(Debug)]
pub struct LayerQueue {
    layer_id: String,
    entries: VecDeque<UpdateQueueEntry>,
    max_len: usize,
    policy: QueuePolicy,
    metrics: QueueMetrics,
}

impl LayerQueue {
    /// Create a queue. A `max_len` of zero is treated as one.
    pub fn new(layer_id: impl Into<String>, max_len: usize, policy: QueuePolicy) -> Self {
        let max_len = max_len.max(1);
        Self {
            layer_id: layer_id.into(),
            entries: VecDeque::with_capacity(max_len),
            max_len,
            policy,
            metrics: QueueMetrics::default(),
        }
    }

    /// Add an entry. Never blocks and never fails.
    pub fn push(&mut self, entry: UpdateQueueEntry) -> EnqueueOutcome {
        self.metrics.enqueued += 1;

        if self.policy == QueuePolicy::KeepLastPerKey {
            if let Some(key) = entry.coalesce_key.as_deref() {
                if let Some(pos) = self
                    .entries
                    .iter()
                    .position(|e| e.coalesce_key.as_deref() == Some(key))
                {
                    self.entries.remove(pos);
                    self.entries.push_back(entry);
                    self.metrics.coalesced += 1;
                    return EnqueueOutcome::Coalesced;
                }
            }
        }

        if self.entries.len() >= self.max_len {
            let dropped = self.entries.pop_front();
            self.entries.push_back(entry);
            self.metrics.dropped += 1;

            let (dropped_sequence, dropped_key) = dropped
                .map(|d| (d.sequence, d.coalesce_key))
                .unwrap_or((0, None));
            return EnqueueOutcome::Overflowed(QueueOverflow {
                layer: self.layer_id.clone(),
                max_len: self.max_len,
                dropped_sequence,
                dropped_key,
            });
        }

        self.entries.push_back(entry);
        EnqueueOutcome::Accepted
    }

    /// Remove all entries in FIFO order for application.
    pub fn drain(&mut self) -> Vec<UpdateQueueEntry> {
        let drained: Vec<_> = self.entries.drain(..).collect();
        self.metrics.flushed += drained.len() as u64;
        drained
    }

    /// Discard all entries without applying them.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.metrics.cleared += n as u64;
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    /// Iterate queued entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &UpdateQueueEntry> {
        self.entries.iter()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Geometry;
    use proptest::prelude::*;

    fn feature(id: &str, lng: f64) -> Feature {
        Feature::new(
            id,
            Geometry::Point {
                coordinates: [lng, 0.0],
            },
        )
    }

    fn lng_of(entry: &UpdateQueueEntry) -> f64 {
        match &entry.payload {
            UpdatePayload::Feature(f) => match f.geometry {
                Geometry::Point { coordinates } => coordinates[0],
                _ => panic!("expected point"),
            },
            UpdatePayload::Collection(_) => panic!("expected feature"),
        }
    }

    #[test]
    fn test_overflow_drops_exactly_one_oldest() {
        let mut queue = LayerQueue::new("alerts", 3, QueuePolicy::Fifo);
        for i in 0..3 {
            assert_eq!(
                queue.push(UpdateQueueEntry::feature("alerts", feature(&format!("a{}", i), 0.0))),
                EnqueueOutcome::Accepted
            );
        }

        let outcome = queue.push(UpdateQueueEntry::feature("alerts", feature("a3", 0.0)));
        match outcome {
            EnqueueOutcome::Overflowed(overflow) => {
                assert_eq!(overflow.dropped_key.as_deref(), Some("a0"));
                assert_eq!(overflow.max_len, 3);
                assert!(overflow.to_string().contains("alerts"));
            }
            other => panic!("expected overflow, got {:?}", other),
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.metrics().dropped, 1);
        let keys: Vec<_> = queue.iter().map(|e| e.coalesce_key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["a1", "a2", "a3"]);

        queue.push(UpdateQueueEntry::feature("alerts", feature("a4", 0.0)));
        assert_eq!(queue.metrics().dropped, 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_keep_last_per_key_collapses() {
        let mut queue = LayerQueue::new("vehicles", 100, QueuePolicy::KeepLastPerKey);
        for i in 0..10 {
            queue.push(UpdateQueueEntry::feature("vehicles", feature("v1", f64::from(i))));
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.metrics().coalesced, 9);
        let drained = queue.drain();
        assert_eq!(lng_of(&drained[0]), 9.0);
    }

    #[test]
    fn test_coalesced_entry_moves_to_back() {
        let mut queue = LayerQueue::new("vehicles", 100, QueuePolicy::KeepLastPerKey);
        queue.push(UpdateQueueEntry::feature("vehicles", feature("v1", 0.0)));
        queue.push(UpdateQueueEntry::feature("vehicles", feature("v2", 0.0)));
        queue.push(UpdateQueueEntry::feature("vehicles", feature("v1", 1.0)));

        let keys: Vec<_> = queue.iter().map(|e| e.coalesce_key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["v2", "v1"]);
    }

    #[test]
    fn test_fifo_keeps_duplicates_in_order() {
        let mut queue = LayerQueue::new("alerts", 100, QueuePolicy::Fifo);
        queue.push(UpdateQueueEntry::feature("alerts", feature("a1", 0.0)));
        queue.push(UpdateQueueEntry::feature("alerts", feature("a1", 1.0)));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(lng_of(&drained[0]), 0.0);
        assert_eq!(lng_of(&drained[1]), 1.0);
        assert!(drained[0].sequence() < drained[1].sequence());
    }

    #[test]
    fn test_overflow_evicts_oldest_regardless_of_priority() {
        let mut queue = LayerQueue::new("mixed", 2, QueuePolicy::Fifo);
        queue.push(UpdateQueueEntry::collection("mixed", FeatureCollection::new()));
        queue.push(UpdateQueueEntry::feature("mixed", feature("d1", 0.0)));
        let outcome = queue.push(UpdateQueueEntry::feature("mixed", feature("d2", 0.0)));

        assert!(matches!(
            outcome,
            EnqueueOutcome::Overflowed(QueueOverflow { dropped_key: None, .. })
        ));
        let kept: Vec<_> = queue
            .iter()
            .map(|e| (e.priority, e.coalesce_key.clone()))
            .collect();
        assert_eq!(
            kept,
            vec![
                (UpdatePriority::DELTA, Some("d1".to_string())),
                (UpdatePriority::DELTA, Some("d2".to_string())),
            ]
        );
    }

    #[test]
    fn test_drain_and_clear_metrics() {
        let mut queue = LayerQueue::new("alerts", 10, QueuePolicy::Fifo);
        queue.push(UpdateQueueEntry::feature("alerts", feature("a1", 0.0)));
        queue.push(UpdateQueueEntry::feature("alerts", feature("a2", 0.0)));
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());

        queue.push(UpdateQueueEntry::feature("alerts", feature("a3", 0.0)));
        assert_eq!(queue.clear(), 1);

        let m = queue.metrics();
        assert_eq!(m.enqueued, 3);
        assert_eq!(m.flushed, 2);
        assert_eq!(m.cleared, 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = LayerQueue::new("x", 0, QueuePolicy::Fifo);
        assert_eq!(queue.max_len(), 1);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_max(max_len in 1usize..20, pushes in 0usize..200) {
            let mut queue = LayerQueue::new("p", max_len, QueuePolicy::Fifo);
            for i in 0..pushes {
                queue.push(UpdateQueueEntry::feature("p", feature(&format!("k{}", i), 0.0)));
                prop_assert!(queue.len() <= max_len);
            }
            let m = queue.metrics();
            prop_assert_eq!(m.dropped as usize, pushes.saturating_sub(max_len));
        }
    }
}
