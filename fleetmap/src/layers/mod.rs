//! Layer abstraction and per-layer update queues.
//!
//! Each layer renders one entity collection. Updates never touch a layer
//! directly: they are enqueued onto the layer's bounded queue and applied
//! together at the next flush so a burst across layers lands in one frame.
//!
//! # Mount Order
//!
//! Layers are mounted by [`LayerGroup`]: static context first, then paths,
//! then moving entities, then overlays. Stacking is therefore deterministic
//! without per-layer z-index tuning.
//!
//! # Backpressure
//!
//! ```text
//! update() ──► LayerQueue (max N) ──► flush() ──► LayerHandle.data ──► engine
//!                 │
//!                 ├─ keep-last-per-key: same entity id collapses to newest
//!                 └─ overflow: drop oldest, count, warn (never block)
//! ```

mod queue;
mod registry;
mod spec;

pub use queue::{
    EnqueueOutcome, LayerQueue, QueueMetrics, QueueOverflow, UpdatePayload, UpdatePriority,
    UpdateQueueEntry, DEFAULT_MAX_QUEUE_LEN,
};
pub use registry::{FlushReport, LayerHandle, LayerMetrics, LayerRegistry, MountEntry};
pub use spec::{default_layer_specs, ApplyMode, LayerGroup, LayerKind, LayerSpec, QueuePolicy};
