//! Generated demo fleet.

use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::engine::{SimulationEngine, VehicleSpec};
use super::route::{SimRoute, Waypoint};
use super::zones::CongestionZone;
use super::{SimulationConfig, SimulationError};
use crate::geo::LngLat;

/// Meters per degree of latitude.
const METERS_PER_DEG: f64 = 111_320.0;

/// Build an engine with `vehicles` vehicles on generated delivery rounds
/// around `center`, plus a congestion zone in the middle.
///
/// Each round leaves the depot at `center`, visits three stops on a ring
/// and returns. Layout is reproducible from the config seed.
pub fn demo_scenario(
    config: SimulationConfig,
    center: LngLat,
    vehicles: usize,
) -> Result<SimulationEngine, SimulationError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut engine = SimulationEngine::new(config);
    engine.add_zone(CongestionZone::new("center", center, 1_500.0, 0.5));

    for i in 0..vehicles {
        let route_id = format!("round-{}", i + 1);
        let heading = TAU * i as f64 / vehicles.max(1) as f64;
        let radius_m = rng.random_range(3_000.0..8_000.0);

        let stops: Vec<Waypoint> = (0..3)
            .map(|s| {
                let angle = heading + (s as f64 - 1.0) * 0.6;
                let position = offset(center, angle, radius_m * (0.6 + 0.2 * s as f64));
                Waypoint::new(format!("{route_id}/stop-{}", s + 1), position, rng.random_range(5..45))
            })
            .collect();

        let mut path = vec![center];
        path.extend(stops.iter().map(|w| w.position));
        path.push(center);
        engine.add_route(SimRoute::new(route_id.clone(), format!("Round {}", i + 1), path, stops)?);

        let speed = rng.random_range(35.0..70.0);
        engine.add_vehicle(
            VehicleSpec::new(format!("veh-{:03}", i + 1), route_id, speed)
                .with_name(format!("Truck {}", i + 1)),
        )?;
    }
    Ok(engine)
}

fn offset(origin: LngLat, angle: f64, distance_m: f64) -> LngLat {
    let dlat = distance_m * angle.cos() / METERS_PER_DEG;
    let dlng = distance_m * angle.sin() / (METERS_PER_DEG * origin.lat.to_radians().cos().max(0.01));
    LngLat::new(origin.lng + dlng, origin.lat + dlat)
}
