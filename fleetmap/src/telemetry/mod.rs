//! Real-time entity telemetry.
//!
//! Each source gets its own [`TelemetryAdapter`] which debounces bursts,
//! smooths position changes and hands the result to the map runtime as an
//! [`UpdateBatch`]. The [`TelemetryManager`] owns the running adapters.
//!
//! # Architecture
//!
//! ```text
//! RealtimeSource ──deltas──► Debouncer ──quiet──► PositionSmoother ──► UpdateSink
//!      │                    (per source)         (ease / snap)        (MapRuntime)
//!      └──snapshot──────────────────────────────────────┐                 │
//!                                                       ▼                 ▼
//!                                          EntitySnapshotCache ◄── write-through
//! ```

mod adapter;
mod debounce;
mod manager;
mod smoothing;
mod source;

pub use adapter::{
    SourceHandle, TelemetryAdapter, TelemetrySourceConfig, TelemetrySourceStatus, TelemetryStats,
};
pub use debounce::{Debouncer, FAST_DEBOUNCE, TOPOLOGY_DEBOUNCE};
pub use manager::TelemetryManager;
pub use smoothing::{
    ease_out_cubic, PositionSmoother, SmoothingConfig, SmoothingDecision,
    DEFAULT_SMOOTHING_DURATION, DEFAULT_TELEPORT_THRESHOLD_M,
};
pub use source::{ChannelSource, RealtimeSource, SourceError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::entities::{
    Alert, Driver, EntityCollection, ShipmentBatch, UpdateBatch, UpdateOrigin, Vehicle,
};
use crate::geo::LngLat;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Errors surfaced by telemetry plumbing.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Source {0} is already registered")]
    DuplicateSource(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// An entity that can arrive through a telemetry stream.
pub trait TelemetryEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Collection the entity belongs to in an [`UpdateBatch`].
    const COLLECTION: EntityCollection;

    fn entity_id(&self) -> &str;

    fn position(&self) -> Option<LngLat>;

    /// Copy of the entity drawn at another position.
    fn with_position(&self, position: LngLat) -> Self;

    fn into_batch(items: Vec<Self>, origin: UpdateOrigin) -> UpdateBatch;
}

impl TelemetryEntity for Vehicle {
    const COLLECTION: EntityCollection = EntityCollection::Vehicles;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Option<LngLat> {
        self.position
    }

    fn with_position(&self, position: LngLat) -> Self {
        Self {
            position: Some(position),
            ..self.clone()
        }
    }

    fn into_batch(items: Vec<Self>, origin: UpdateOrigin) -> UpdateBatch {
        UpdateBatch::new(origin).with_vehicles(items)
    }
}

impl TelemetryEntity for Driver {
    const COLLECTION: EntityCollection = EntityCollection::Drivers;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Option<LngLat> {
        self.position
    }

    fn with_position(&self, position: LngLat) -> Self {
        Self {
            position: Some(position),
            ..self.clone()
        }
    }

    fn into_batch(items: Vec<Self>, origin: UpdateOrigin) -> UpdateBatch {
        UpdateBatch::new(origin).with_drivers(items)
    }
}

impl TelemetryEntity for Alert {
    const COLLECTION: EntityCollection = EntityCollection::Alerts;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Option<LngLat> {
        self.position
    }

    fn with_position(&self, position: LngLat) -> Self {
        Self {
            position: Some(position),
            ..self.clone()
        }
    }

    fn into_batch(items: Vec<Self>, origin: UpdateOrigin) -> UpdateBatch {
        UpdateBatch::new(origin).with_alerts(items)
    }
}

impl TelemetryEntity for ShipmentBatch {
    const COLLECTION: EntityCollection = EntityCollection::Batches;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Option<LngLat> {
        self.position
    }

    fn with_position(&self, position: LngLat) -> Self {
        Self {
            position: Some(position),
            ..self.clone()
        }
    }

    fn into_batch(items: Vec<Self>, origin: UpdateOrigin) -> UpdateBatch {
        UpdateBatch::new(origin).with_batches(items)
    }
}
