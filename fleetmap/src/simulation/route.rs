//! Simulated routes: a path plus delivery stops along it.

use serde::{Deserialize, Serialize};

use super::SimulationError;
use crate::entities::{Route, RouteStatus};
use crate::geo::{LngLat, Polyline};

/// A stop on a route where the vehicle dwells and unloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub position: LngLat,
    /// Units delivered here.
    pub load: u32,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, position: LngLat, load: u32) -> Self {
        Self {
            name: name.into(),
            position,
            load,
        }
    }
}

/// A waypoint resolved to its distance along the path.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStop {
    pub waypoint: Waypoint,
    pub distance_m: f64,
}

/// A route the simulation drives vehicles along.
#[derive(Debug, Clone, PartialEq)]
pub struct SimRoute {
    id: String,
    name: String,
    path: Polyline,
    stops: Vec<RouteStop>,
}

impl SimRoute {
    /// Build a route from a path and the stops along it.
    ///
    /// Each waypoint snaps to the nearest path vertex at or after the
    /// previous stop, so stops keep their order along the path.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        path: Vec<LngLat>,
        waypoints: Vec<Waypoint>,
    ) -> Result<Self, SimulationError> {
        let id = id.into();
        let path = Polyline::new(path).ok_or_else(|| SimulationError::InvalidRoute {
            route_id: id.clone(),
            reason: "path needs at least two valid points".to_string(),
        })?;

        let mut stops = Vec::with_capacity(waypoints.len());
        let mut from = 0;
        for waypoint in waypoints {
            if !waypoint.position.is_valid() {
                return Err(SimulationError::InvalidRoute {
                    route_id: id,
                    reason: format!("waypoint {} has invalid position", waypoint.name),
                });
            }
            let index = nearest_vertex(path.points(), from, &waypoint.position);
            let distance_m = path.distance_at_vertex(index).unwrap_or(0.0);
            stops.push(RouteStop {
                waypoint,
                distance_m,
            });
            from = index;
        }

        Ok(Self {
            id,
            name: name.into(),
            path,
            stops,
        })
    }

    /// A route that starts at `origin` and visits each waypoint in a straight
    /// line.
    pub fn through_waypoints(
        id: impl Into<String>,
        name: impl Into<String>,
        origin: LngLat,
        waypoints: Vec<Waypoint>,
    ) -> Result<Self, SimulationError> {
        let path = std::iter::once(origin)
            .chain(waypoints.iter().map(|w| w.position))
            .collect();
        Self::new(id, name, path, waypoints)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Polyline {
        &self.path
    }

    pub fn stops(&self) -> &[RouteStop] {
        &self.stops
    }

    pub fn length_m(&self) -> f64 {
        self.path.length_m()
    }

    /// Sum of all stop loads.
    pub fn total_load(&self) -> u32 {
        self.stops.iter().map(|s| s.waypoint.load).sum()
    }

    /// The route as a displayable entity.
    pub fn to_entity(&self, status: RouteStatus) -> Route {
        Route {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.points().to_vec(),
            status,
        }
    }
}

fn nearest_vertex(points: &[LngLat], from: usize, target: &LngLat) -> usize {
    points
        .iter()
        .enumerate()
        .skip(from)
        .map(|(i, p)| (i, p.distance_m(target)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(from, |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_resolve_to_path_distance() {
        let route = SimRoute::through_waypoints(
            "r1",
            "Test",
            LngLat::new(0.0, 0.0),
            vec![
                Waypoint::new("a", LngLat::new(0.0, 0.01), 5),
                Waypoint::new("b", LngLat::new(0.0, 0.02), 7),
            ],
        )
        .unwrap();

        assert_eq!(route.stops().len(), 2);
        assert!(route.stops()[0].distance_m > 1000.0);
        assert!((route.stops()[1].distance_m - route.length_m()).abs() < 1e-6);
        assert_eq!(route.total_load(), 12);
    }

    #[test]
    fn test_revisited_position_keeps_order() {
        let depot = LngLat::new(0.0, 0.0);
        let far = LngLat::new(0.0, 0.01);
        let route = SimRoute::new(
            "loop",
            "Loop",
            vec![depot, far, depot],
            vec![Waypoint::new("far", far, 1), Waypoint::new("back", depot, 1)],
        )
        .unwrap();

        assert!(route.stops()[1].distance_m > route.stops()[0].distance_m);
    }

    #[test]
    fn test_invalid_path_is_rejected() {
        let err = SimRoute::new("r", "R", vec![LngLat::new(0.0, 0.0)], vec![]).unwrap_err();
        assert!(matches!(err, SimulationError::InvalidRoute { .. }));
    }
}
