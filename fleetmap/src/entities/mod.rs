//! Domain entities and the closed update-batch type.
//!
//! These are the business objects the map displays. They are plain data:
//! transformation into features lives in [`crate::geo::transform`], and the
//! map runtime only ever sees them through [`UpdateBatch`].

mod batch;

pub use batch::{EntityCollection, PlaybackRange, UpdateBatch, UpdateOrigin};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::LngLat;

/// Operational status of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    /// Driving along its route.
    Moving,
    /// Stopped at a waypoint (delivery in progress).
    Dwelling,
    /// Stationary without a delivery.
    Idle,
    /// Broken down.
    Breakdown,
    /// Not reporting.
    Offline,
}

/// A tracked vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub name: String,
    pub position: Option<LngLat>,
    /// Heading in degrees (0 = north).
    pub heading: f64,
    pub speed_kmh: f64,
    pub status: VehicleStatus,
    pub capacity_total: u32,
    pub capacity_remaining: u32,
    pub route_id: Option<String>,
}

/// Driver availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    OnDuty,
    OnBreak,
    OffDuty,
}

/// A driver, positioned at their vehicle or last known location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub position: Option<LngLat>,
    pub status: DriverStatus,
    pub vehicle_id: Option<String>,
}

/// Route lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Planned,
    Active,
    Completed,
}

/// A planned or active route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub path: Vec<LngLat>,
    pub status: RouteStatus,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A discrete operational alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub position: Option<LngLat>,
    pub vehicle_id: Option<String>,
    pub raised_at: DateTime<Utc>,
}

/// Shipment batch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InTransit,
    Delivered,
}

/// A shipment batch travelling with a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentBatch {
    pub id: String,
    pub position: Option<LngLat>,
    pub status: BatchStatus,
    pub quantity: u32,
    pub vehicle_id: Option<String>,
}

/// A static facility (depot, service station).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: String,
    pub name: String,
    pub position: Option<LngLat>,
    pub kind: String,
}

/// A warehouse with utilization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: String,
    pub name: String,
    pub position: Option<LngLat>,
    pub capacity: u32,
    pub stored: u32,
}

impl Warehouse {
    /// Utilization ratio (0.0 - 1.0), zero when capacity is zero.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (f64::from(self.stored) / f64::from(self.capacity)).min(1.0)
        }
    }
}

/// A point in a vehicle's trail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub position: LngLat,
    /// Recency weight: 1.0 for the newest point, approaching 0 for the oldest.
    pub opacity: f64,
}

/// Recent path history of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    pub vehicle_id: String,
    /// Oldest first.
    pub points: Vec<TrailPoint>,
}
