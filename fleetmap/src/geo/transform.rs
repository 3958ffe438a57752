//! Domain entities → feature collections.
//!
//! Pure functions. Each feature gets a flat property bag including a
//! precomputed `markerColor`, so layer rendering never needs to look at the
//! domain types. Entities without a valid position are skipped; no NaN or
//! missing geometry ever leaves this module.

use serde_json::Value;

use super::{valid_position, Feature, FeatureCollection, Geometry, LngLat};
use crate::entities::{
    Alert, AlertSeverity, BatchStatus, Driver, DriverStatus, Facility, Route, RouteStatus,
    ShipmentBatch, Trail, Vehicle, VehicleStatus, Warehouse,
};

/// Marker colors shared by all transforms.
pub mod colors {
    pub const GREEN: &str = "#22c55e";
    pub const AMBER: &str = "#eab308";
    pub const BLUE: &str = "#3b82f6";
    pub const RED: &str = "#ef4444";
    pub const GRAY: &str = "#6b7280";
    pub const PURPLE: &str = "#8b5cf6";
    pub const ORANGE: &str = "#f97316";
}

/// Property carrying the precomputed visual state.
pub const MARKER_COLOR: &str = "markerColor";

/// Property set by focus mode on features outside the focus.
pub const DIMMED: &str = "dimmed";

fn point_feature(id: &str, position: LngLat) -> Feature {
    Feature::new(
        id,
        Geometry::Point {
            coordinates: position.to_coordinates(),
        },
    )
}

/// Marker color for a vehicle status.
pub fn vehicle_color(status: VehicleStatus) -> &'static str {
    match status {
        VehicleStatus::Moving => colors::GREEN,
        VehicleStatus::Idle => colors::AMBER,
        VehicleStatus::Dwelling => colors::BLUE,
        VehicleStatus::Breakdown => colors::RED,
        VehicleStatus::Offline => colors::GRAY,
    }
}

/// Marker color for an alert severity.
pub fn alert_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => colors::BLUE,
        AlertSeverity::Warning => colors::ORANGE,
        AlertSeverity::Critical => colors::RED,
    }
}

/// Marker color for warehouse utilization.
pub fn utilization_color(utilization: f64) -> &'static str {
    if utilization >= 0.9 {
        colors::RED
    } else if utilization >= 0.7 {
        colors::AMBER
    } else {
        colors::GREEN
    }
}

fn enum_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub fn vehicles(vehicles: &[Vehicle]) -> FeatureCollection {
    vehicles
        .iter()
        .filter_map(|v| {
            let position = valid_position(v.position)?;
            let load_ratio = if v.capacity_total == 0 {
                0.0
            } else {
                f64::from(v.capacity_remaining) / f64::from(v.capacity_total)
            };
            Some(
                point_feature(&v.id, position)
                    .with_property("kind", "vehicle")
                    .with_property("name", v.name.clone())
                    .with_property("heading", v.heading)
                    .with_property("speedKmh", v.speed_kmh)
                    .with_property("status", enum_value(&v.status))
                    .with_property("capacityRemaining", v.capacity_remaining)
                    .with_property("loadRatio", load_ratio)
                    .with_property("routeId", v.route_id.clone())
                    .with_property("weight", 1.0)
                    .with_property(MARKER_COLOR, vehicle_color(v.status)),
            )
        })
        .collect()
}

pub fn drivers(drivers: &[Driver]) -> FeatureCollection {
    drivers
        .iter()
        .filter_map(|d| {
            let position = valid_position(d.position)?;
            let color = match d.status {
                DriverStatus::OnDuty => colors::GREEN,
                DriverStatus::OnBreak => colors::AMBER,
                DriverStatus::OffDuty => colors::GRAY,
            };
            Some(
                point_feature(&d.id, position)
                    .with_property("kind", "driver")
                    .with_property("name", d.name.clone())
                    .with_property("status", enum_value(&d.status))
                    .with_property("vehicleId", d.vehicle_id.clone())
                    .with_property(MARKER_COLOR, color),
            )
        })
        .collect()
}

/// Routes become line strings. A route with any invalid vertex is dropped
/// whole rather than drawn with a gap.
pub fn routes(routes: &[Route]) -> FeatureCollection {
    routes
        .iter()
        .filter(|r| r.path.len() >= 2 && r.path.iter().all(LngLat::is_valid))
        .map(|r| {
            let color = match r.status {
                RouteStatus::Planned => colors::PURPLE,
                RouteStatus::Active => colors::BLUE,
                RouteStatus::Completed => colors::GRAY,
            };
            Feature::new(
                &r.id,
                Geometry::LineString {
                    coordinates: r.path.iter().map(LngLat::to_coordinates).collect(),
                },
            )
            .with_property("kind", "route")
            .with_property("name", r.name.clone())
            .with_property("status", enum_value(&r.status))
            .with_property(MARKER_COLOR, color)
        })
        .collect()
}

pub fn alerts(alerts: &[Alert]) -> FeatureCollection {
    alerts
        .iter()
        .filter_map(|a| {
            let position = valid_position(a.position)?;
            Some(
                point_feature(&a.id, position)
                    .with_property("kind", "alert")
                    .with_property("severity", enum_value(&a.severity))
                    .with_property("message", a.message.clone())
                    .with_property("vehicleId", a.vehicle_id.clone())
                    .with_property("raisedAt", a.raised_at.to_rfc3339())
                    .with_property(MARKER_COLOR, alert_color(a.severity)),
            )
        })
        .collect()
}

pub fn batches(batches: &[ShipmentBatch]) -> FeatureCollection {
    batches
        .iter()
        .filter_map(|b| {
            let position = valid_position(b.position)?;
            let color = match b.status {
                BatchStatus::Pending => colors::AMBER,
                BatchStatus::InTransit => colors::BLUE,
                BatchStatus::Delivered => colors::GREEN,
            };
            Some(
                point_feature(&b.id, position)
                    .with_property("kind", "batch")
                    .with_property("status", enum_value(&b.status))
                    .with_property("quantity", b.quantity)
                    .with_property("vehicleId", b.vehicle_id.clone())
                    .with_property(MARKER_COLOR, color),
            )
        })
        .collect()
}

pub fn facilities(facilities: &[Facility]) -> FeatureCollection {
    facilities
        .iter()
        .filter_map(|f| {
            let position = valid_position(f.position)?;
            Some(
                point_feature(&f.id, position)
                    .with_property("kind", "facility")
                    .with_property("name", f.name.clone())
                    .with_property("facilityKind", f.kind.clone())
                    .with_property(MARKER_COLOR, colors::PURPLE),
            )
        })
        .collect()
}

pub fn warehouses(warehouses: &[Warehouse]) -> FeatureCollection {
    warehouses
        .iter()
        .filter_map(|w| {
            let position = valid_position(w.position)?;
            let utilization = w.utilization();
            Some(
                point_feature(&w.id, position)
                    .with_property("kind", "warehouse")
                    .with_property("name", w.name.clone())
                    .with_property("utilization", utilization)
                    .with_property(MARKER_COLOR, utilization_color(utilization)),
            )
        })
        .collect()
}

/// Trails become line strings of their valid points. The per-point fade is
/// flattened into an `opacities` array aligned with the coordinates.
pub fn trails(trails: &[Trail]) -> FeatureCollection {
    trails
        .iter()
        .filter_map(|t| {
            let points: Vec<_> = t.points.iter().filter(|p| p.position.is_valid()).collect();
            if points.len() < 2 {
                return None;
            }
            let coordinates = points.iter().map(|p| p.position.to_coordinates()).collect();
            let opacities: Vec<Value> = points.iter().map(|p| Value::from(p.opacity)).collect();
            Some(
                Feature::new(format!("trail:{}", t.vehicle_id), Geometry::LineString { coordinates })
                    .with_property("kind", "trail")
                    .with_property("vehicleId", t.vehicle_id.clone())
                    .with_property("opacities", Value::Array(opacities))
                    .with_property(MARKER_COLOR, colors::BLUE),
            )
        })
        .collect()
}

/// Features whose `kind` property is `alert`.
pub fn alerts_only(collection: &FeatureCollection) -> FeatureCollection {
    collection.filter(|f| f.property("kind").and_then(Value::as_str) == Some("alert"))
}

/// Focus mode: flag every feature not in `focus_ids` as dimmed.
pub fn focus(collection: &FeatureCollection, focus_ids: &[&str]) -> FeatureCollection {
    collection.flag_where(DIMMED, |f| !focus_ids.contains(&f.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TrailPoint;
    use chrono::Utc;

    fn vehicle(id: &str, position: Option<LngLat>, status: VehicleStatus) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: format!("Truck {}", id),
            position,
            heading: 90.0,
            speed_kmh: 42.0,
            status,
            capacity_total: 100,
            capacity_remaining: 25,
            route_id: Some("r1".to_string()),
        }
    }

    fn assert_all_finite(fc: &FeatureCollection) {
        for f in fc.iter() {
            assert!(f.geometry.is_valid(), "feature {} has invalid geometry", f.id);
        }
    }

    #[test]
    fn test_vehicles_excludes_invalid_positions() {
        let input = vec![
            vehicle("ok", Some(LngLat::new(10.0, 53.0)), VehicleStatus::Moving),
            vehicle("none", None, VehicleStatus::Moving),
            vehicle("nan", Some(LngLat::new(f64::NAN, 53.0)), VehicleStatus::Moving),
            vehicle("inf", Some(LngLat::new(10.0, f64::INFINITY)), VehicleStatus::Moving),
            vehicle("range", Some(LngLat::new(200.0, 53.0)), VehicleStatus::Moving),
        ];
        let fc = vehicles(&input);
        assert_eq!(fc.len(), 1);
        assert!(fc.get("ok").is_some());
        assert_all_finite(&fc);
    }

    #[test]
    fn test_vehicle_marker_color_and_properties() {
        let fc = vehicles(&[vehicle(
            "v1",
            Some(LngLat::new(10.0, 53.0)),
            VehicleStatus::Breakdown,
        )]);
        let f = fc.get("v1").unwrap();
        assert_eq!(f.property(MARKER_COLOR), Some(&Value::from(colors::RED)));
        assert_eq!(f.property("status"), Some(&Value::from("breakdown")));
        assert_eq!(f.property("loadRatio"), Some(&Value::from(0.25)));
    }

    #[test]
    fn test_routes_drop_partial_geometry() {
        let input = vec![
            Route {
                id: "good".into(),
                name: "A".into(),
                path: vec![LngLat::new(0.0, 0.0), LngLat::new(1.0, 1.0)],
                status: RouteStatus::Active,
            },
            Route {
                id: "bad".into(),
                name: "B".into(),
                path: vec![LngLat::new(0.0, 0.0), LngLat::new(f64::NAN, 1.0)],
                status: RouteStatus::Active,
            },
            Route {
                id: "short".into(),
                name: "C".into(),
                path: vec![LngLat::new(0.0, 0.0)],
                status: RouteStatus::Planned,
            },
        ];
        let fc = routes(&input);
        assert_eq!(fc.len(), 1);
        assert!(fc.get("good").is_some());
    }

    #[test]
    fn test_trails_skip_invalid_points() {
        let trail = Trail {
            vehicle_id: "v1".into(),
            points: vec![
                TrailPoint {
                    position: LngLat::new(0.0, 0.0),
                    opacity: 0.5,
                },
                TrailPoint {
                    position: LngLat::new(f64::NAN, 0.0),
                    opacity: 0.75,
                },
                TrailPoint {
                    position: LngLat::new(0.0, 0.001),
                    opacity: 1.0,
                },
            ],
        };
        let fc = trails(&[trail]);
        let f = fc.get("trail:v1").unwrap();
        match &f.geometry {
            Geometry::LineString { coordinates } => assert_eq!(coordinates.len(), 2),
            other => panic!("unexpected geometry {:?}", other),
        }
        assert_all_finite(&fc);
    }

    #[test]
    fn test_warehouse_utilization_color() {
        let w = Warehouse {
            id: "w1".into(),
            name: "North".into(),
            position: Some(LngLat::new(1.0, 1.0)),
            capacity: 100,
            stored: 95,
        };
        let fc = warehouses(&[w]);
        assert_eq!(
            fc.get("w1").unwrap().property(MARKER_COLOR),
            Some(&Value::from(colors::RED))
        );
    }

    #[test]
    fn test_alerts_only_and_focus() {
        let alert = Alert {
            id: "a1".into(),
            severity: AlertSeverity::Critical,
            message: "engine".into(),
            position: Some(LngLat::new(1.0, 1.0)),
            vehicle_id: None,
            raised_at: Utc::now(),
        };
        let merged = FeatureCollection::merge([
            &alerts(&[alert]),
            &vehicles(&[vehicle(
                "v1",
                Some(LngLat::new(2.0, 2.0)),
                VehicleStatus::Moving,
            )]),
        ]);

        let only = alerts_only(&merged);
        assert_eq!(only.len(), 1);
        assert!(only.get("a1").is_some());

        let focused = focus(&merged, &["v1"]);
        assert_eq!(focused.len(), 2);
        assert_eq!(focused.get("a1").unwrap().property(DIMMED), Some(&Value::Bool(true)));
        assert_eq!(focused.get("v1").unwrap().property(DIMMED), Some(&Value::Bool(false)));
    }
}
