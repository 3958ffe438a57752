//! Geographic primitives and renderer-agnostic feature collections.
//!
//! This module holds everything the map pipeline needs to talk about
//! positions without knowing about a particular rendering engine:
//!
//! - [`LngLat`] and great-circle helpers (haversine distance, bearing, lerp)
//! - [`Polyline`] - a distance-indexed path used by the simulation
//! - [`Feature`] / [`FeatureCollection`] - GeoJSON-shaped layer payloads
//! - [`transform`] - pure functions turning domain entities into features
//!
//! # Coordinate Validity
//!
//! A coordinate is valid when both components are finite and within WGS84
//! bounds. Invalid coordinates never reach a feature collection; the
//! transformer drops the owning entity instead.

mod feature;
mod polyline;
pub mod transform;

pub use feature::{Feature, FeatureCollection, Geometry, Properties};
pub use polyline::Polyline;

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A WGS84 position (longitude first, matching GeoJSON ordering).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    /// Longitude in degrees (-180..=180).
    pub lng: f64,
    /// Latitude in degrees (-90..=90).
    pub lat: f64,
}

impl LngLat {
    /// Create a new position.
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Check that both components are finite and inside WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lng.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lng)
            && (-90.0..=90.0).contains(&self.lat)
    }

    /// Great-circle distance to another position in meters.
    pub fn distance_m(&self, other: &LngLat) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// Initial bearing towards another position in degrees (0 = north, 90 = east).
    pub fn bearing_to(&self, other: &LngLat) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let y = dlng.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
        let bearing = y.atan2(x).to_degrees();

        if bearing < 0.0 {
            bearing + 360.0
        } else {
            bearing
        }
    }

    /// Linear interpolation between two positions.
    ///
    /// Adequate for the short hops produced by telemetry smoothing and
    /// simulation steps; not a geodesic interpolation.
    pub fn lerp(&self, other: &LngLat, t: f64) -> LngLat {
        let t = t.clamp(0.0, 1.0);
        LngLat {
            lng: self.lng + (other.lng - self.lng) * t,
            lat: self.lat + (other.lat - self.lat) * t,
        }
    }

    /// GeoJSON coordinate pair.
    pub fn to_coordinates(&self) -> [f64; 2] {
        [self.lng, self.lat]
    }
}

impl std::fmt::Display for LngLat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lng, self.lat)
    }
}

/// Returns the position if present and valid.
pub fn valid_position(position: Option<LngLat>) -> Option<LngLat> {
    position.filter(LngLat::is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_bounds() {
        assert!(LngLat::new(10.0, 53.5).is_valid());
        assert!(LngLat::new(-180.0, -90.0).is_valid());
        assert!(!LngLat::new(180.1, 0.0).is_valid());
        assert!(!LngLat::new(0.0, 90.5).is_valid());
        assert!(!LngLat::new(f64::NAN, 0.0).is_valid());
        assert!(!LngLat::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = LngLat::new(0.0, 0.0);
        let b = LngLat::new(0.0, 1.0);
        let d = a.distance_m(&b);
        assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = LngLat::new(9.99, 53.55);
        let b = LngLat::new(13.40, 52.52);
        assert!((a.distance_m(&b) - b.distance_m(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = LngLat::new(0.0, 0.0);
        assert!((origin.bearing_to(&LngLat::new(0.0, 1.0)) - 0.0).abs() < 1e-6);
        assert!((origin.bearing_to(&LngLat::new(1.0, 0.0)) - 90.0).abs() < 1e-6);
        assert!((origin.bearing_to(&LngLat::new(0.0, -1.0)) - 180.0).abs() < 1e-6);
        assert!((origin.bearing_to(&LngLat::new(-1.0, 0.0)) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn test_lerp_clamps() {
        let a = LngLat::new(0.0, 0.0);
        let b = LngLat::new(10.0, 20.0);
        assert_eq!(a.lerp(&b, 0.5), LngLat::new(5.0, 10.0));
        assert_eq!(a.lerp(&b, 2.0), b);
        assert_eq!(a.lerp(&b, -1.0), a);
    }

    #[test]
    fn test_valid_position_filters() {
        assert!(valid_position(None).is_none());
        assert!(valid_position(Some(LngLat::new(f64::NAN, 1.0))).is_none());
        assert!(valid_position(Some(LngLat::new(1.0, 1.0))).is_some());
    }
}
