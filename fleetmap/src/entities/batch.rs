//! Update batches.
//!
//! An [`UpdateBatch`] is a partial update keyed by entity collection. Absent
//! collections are left untouched by the runtime. The batch is a closed
//! struct so consumers match on known collections instead of string keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Alert, Driver, Facility, Route, ShipmentBatch, Trail, Vehicle, Warehouse};
use crate::geo::transform;
use crate::geo::FeatureCollection;

/// Entity collections the map knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCollection {
    Vehicles,
    Drivers,
    Routes,
    Alerts,
    Batches,
    Facilities,
    Warehouses,
    Trails,
}

impl EntityCollection {
    /// All collections.
    pub const ALL: [EntityCollection; 8] = [
        EntityCollection::Vehicles,
        EntityCollection::Drivers,
        EntityCollection::Routes,
        EntityCollection::Alerts,
        EntityCollection::Batches,
        EntityCollection::Facilities,
        EntityCollection::Warehouses,
        EntityCollection::Trails,
    ];

    /// Stable name, also used as the entity-snapshot key in the offline store.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCollection::Vehicles => "vehicles",
            EntityCollection::Drivers => "drivers",
            EntityCollection::Routes => "routes",
            EntityCollection::Alerts => "alerts",
            EntityCollection::Batches => "batches",
            EntityCollection::Facilities => "facilities",
            EntityCollection::Warehouses => "warehouses",
            EntityCollection::Trails => "trails",
        }
    }
}

impl fmt::Display for EntityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a batch came from. Drives the mode-contract check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Real-time telemetry (live or simulated).
    #[default]
    Live,
    /// Full snapshot fetch or offline hydration.
    Snapshot,
    /// A user edit.
    Edit,
    /// Recorded data replayed for historical playback.
    Playback,
}

/// A closed time interval for historical playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PlaybackRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// A range is usable when it spans a positive interval.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// A partial update keyed by entity collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub origin: UpdateOrigin,
    pub vehicles: Option<Vec<Vehicle>>,
    pub drivers: Option<Vec<Driver>>,
    pub routes: Option<Vec<Route>>,
    pub alerts: Option<Vec<Alert>>,
    pub batches: Option<Vec<ShipmentBatch>>,
    pub facilities: Option<Vec<Facility>>,
    pub warehouses: Option<Vec<Warehouse>>,
    pub trails: Option<Vec<Trail>>,
    pub playback: Option<PlaybackRange>,
}

impl UpdateBatch {
    /// Empty batch with the given origin.
    pub fn new(origin: UpdateOrigin) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Empty live-telemetry batch.
    pub fn live() -> Self {
        Self::new(UpdateOrigin::Live)
    }

    pub fn with_vehicles(mut self, vehicles: Vec<Vehicle>) -> Self {
        self.vehicles = Some(vehicles);
        self
    }

    pub fn with_drivers(mut self, drivers: Vec<Driver>) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_alerts(mut self, alerts: Vec<Alert>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_batches(mut self, batches: Vec<ShipmentBatch>) -> Self {
        self.batches = Some(batches);
        self
    }

    pub fn with_facilities(mut self, facilities: Vec<Facility>) -> Self {
        self.facilities = Some(facilities);
        self
    }

    pub fn with_warehouses(mut self, warehouses: Vec<Warehouse>) -> Self {
        self.warehouses = Some(warehouses);
        self
    }

    pub fn with_trails(mut self, trails: Vec<Trail>) -> Self {
        self.trails = Some(trails);
        self
    }

    pub fn with_playback(mut self, range: PlaybackRange) -> Self {
        self.playback = Some(range);
        self
    }

    /// Collections present in this batch.
    pub fn collections(&self) -> Vec<EntityCollection> {
        EntityCollection::ALL
            .into_iter()
            .filter(|c| self.contains(*c))
            .collect()
    }

    /// True if the batch carries the given collection (even if empty).
    pub fn contains(&self, collection: EntityCollection) -> bool {
        match collection {
            EntityCollection::Vehicles => self.vehicles.is_some(),
            EntityCollection::Drivers => self.drivers.is_some(),
            EntityCollection::Routes => self.routes.is_some(),
            EntityCollection::Alerts => self.alerts.is_some(),
            EntityCollection::Batches => self.batches.is_some(),
            EntityCollection::Facilities => self.facilities.is_some(),
            EntityCollection::Warehouses => self.warehouses.is_some(),
            EntityCollection::Trails => self.trails.is_some(),
        }
    }

    /// True if any entity collection is present.
    pub fn has_entity_data(&self) -> bool {
        EntityCollection::ALL.iter().any(|c| self.contains(*c))
    }

    /// True if nothing is present at all.
    pub fn is_empty(&self) -> bool {
        !self.has_entity_data() && self.playback.is_none()
    }

    /// Transform one collection into features, if present.
    pub fn features_for(&self, collection: EntityCollection) -> Option<FeatureCollection> {
        match collection {
            EntityCollection::Vehicles => self.vehicles.as_deref().map(transform::vehicles),
            EntityCollection::Drivers => self.drivers.as_deref().map(transform::drivers),
            EntityCollection::Routes => self.routes.as_deref().map(transform::routes),
            EntityCollection::Alerts => self.alerts.as_deref().map(transform::alerts),
            EntityCollection::Batches => self.batches.as_deref().map(transform::batches),
            EntityCollection::Facilities => self.facilities.as_deref().map(transform::facilities),
            EntityCollection::Warehouses => self.warehouses.as_deref().map(transform::warehouses),
            EntityCollection::Trails => self.trails.as_deref().map(transform::trails),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Facility, Vehicle, VehicleStatus};
    use crate::geo::LngLat;
    use chrono::Duration;

    fn vehicle(id: &str) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: id.to_string(),
            position: Some(LngLat::new(10.0, 53.0)),
            heading: 0.0,
            speed_kmh: 30.0,
            status: VehicleStatus::Moving,
            capacity_total: 100,
            capacity_remaining: 100,
            route_id: None,
        }
    }

    #[test]
    fn test_collections_present() {
        let batch = UpdateBatch::live()
            .with_vehicles(vec![vehicle("v1")])
            .with_facilities(Vec::<Facility>::new());

        assert_eq!(
            batch.collections(),
            vec![EntityCollection::Vehicles, EntityCollection::Facilities]
        );
        assert!(batch.has_entity_data());
        assert!(!batch.contains(EntityCollection::Alerts));
    }

    #[test]
    fn test_empty_batch() {
        let batch = UpdateBatch::live();
        assert!(batch.is_empty());
        assert!(batch.features_for(EntityCollection::Vehicles).is_none());
    }

    #[test]
    fn test_features_for_transforms() {
        let batch = UpdateBatch::live().with_vehicles(vec![vehicle("v1"), vehicle("v2")]);
        let features = batch.features_for(EntityCollection::Vehicles).unwrap();
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn test_playback_range_validity() {
        let now = Utc::now();
        assert!(PlaybackRange::new(now, now + Duration::minutes(5)).is_valid());
        assert!(!PlaybackRange::new(now, now).is_valid());
        let range = PlaybackRange::new(now, now + Duration::minutes(5));
        assert!(range.contains(now + Duration::minutes(1)));
        assert!(!range.contains(now - Duration::minutes(1)));
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(EntityCollection::Vehicles.to_string(), "vehicles");
        assert_eq!(EntityCollection::Warehouses.as_str(), "warehouses");
    }
}
