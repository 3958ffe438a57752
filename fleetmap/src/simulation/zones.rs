//! Congestion zones.

use serde::{Deserialize, Serialize};

use crate::geo::LngLat;

/// A circular area that slows traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CongestionZone {
    pub id: String,
    pub center: LngLat,
    pub radius_m: f64,
    /// Speed factor inside the zone (0.0 - 1.0).
    pub multiplier: f64,
}

impl CongestionZone {
    pub fn new(id: impl Into<String>, center: LngLat, radius_m: f64, multiplier: f64) -> Self {
        Self {
            id: id.into(),
            center,
            radius_m: radius_m.max(0.0),
            multiplier: multiplier.clamp(0.0, 1.0),
        }
    }

    pub fn contains(&self, position: &LngLat) -> bool {
        self.center.distance_m(position) <= self.radius_m
    }
}

/// Spatial lookup over all zones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneMap {
    zones: Vec<CongestionZone>,
}

impl ZoneMap {
    pub fn new(zones: Vec<CongestionZone>) -> Self {
        Self { zones }
    }

    pub fn add(&mut self, zone: CongestionZone) {
        self.zones.push(zone);
    }

    pub fn zones(&self) -> &[CongestionZone] {
        &self.zones
    }

    /// Speed factor at a position: the slowest zone that contains it, or 1.0.
    pub fn multiplier_at(&self, position: &LngLat) -> f64 {
        self.zones
            .iter()
            .filter(|z| z.contains(position))
            .map(|z| z.multiplier)
            .fold(1.0, f64::min)
    }
}
