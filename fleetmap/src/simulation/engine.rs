//! The movement engine.
//!
//! Each vehicle advances along its route's distance-indexed path:
//!
//! ```text
//! distance += base_speed × zone_multiplier × event_multiplier × dt
//! ```
//!
//! # Vehicle Phases
//!
//! ```text
//!            cross stop distance              dwell elapsed
//!  Moving ───────────────────────► Dwelling ─────────────────► Moving
//!    │                             (distance frozen,            (capacity -= load,
//!    │ end of path                  WaypointReached)             DeliveryCompleted)
//!    ▼
//!  Loop: restart at 0 with full capacity    Stop: Finished (idle)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use super::events::{ActiveEvent, EventKind, EventScheduler, EventSet, ScheduledEvent};
use super::route::SimRoute;
use super::trail::TrailBuffer;
use super::zones::{CongestionZone, ZoneMap};
use super::{RouteCompletion, SimulationConfig, SimulationError};
use crate::entities::{Trail, Vehicle, VehicleStatus};
use crate::geo::LngLat;

/// What a vehicle is doing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionPhase {
    Moving,
    Dwelling {
        stop_index: usize,
        remaining: Duration,
    },
    Finished,
}

/// Something noteworthy that happened during a step.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    WaypointReached {
        vehicle_id: String,
        stop_index: usize,
        name: String,
    },
    DeliveryCompleted {
        vehicle_id: String,
        stop_index: usize,
        delivered: u32,
        remaining_capacity: u32,
    },
    EventStarted {
        vehicle_id: String,
        kind: EventKind,
        duration: Duration,
    },
    EventExpired {
        vehicle_id: String,
        kind: EventKind,
    },
    RouteRestarted {
        vehicle_id: String,
    },
    RouteCompleted {
        vehicle_id: String,
    },
}

/// Parameters for adding a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSpec {
    pub id: String,
    pub name: String,
    pub route_id: String,
    /// Cruising speed in km/h before any multipliers.
    pub base_speed_kmh: f64,
    pub capacity: u32,
}

impl VehicleSpec {
    pub fn new(id: impl Into<String>, route_id: impl Into<String>, base_speed_kmh: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            route_id: route_id.into(),
            base_speed_kmh,
            capacity: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Capacity at departure; defaults to the route's total load.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Simulation state of one vehicle.
#[derive(Debug, Clone)]
pub struct SimVehicle {
    pub id: String,
    pub name: String,
    pub route_id: String,
    pub base_speed_mps: f64,
    pub distance_m: f64,
    pub capacity_total: u32,
    pub capacity_remaining: u32,
    /// Index of the next stop to reach.
    pub next_stop: usize,
    pub phase: MotionPhase,
    pub position: LngLat,
    pub heading: f64,
    /// Effective speed over the last step.
    pub speed_mps: f64,
    pub events: EventSet,
    pub trail: TrailBuffer,
    pub laps: u32,
}

impl SimVehicle {
    pub fn status(&self) -> VehicleStatus {
        match self.phase {
            MotionPhase::Dwelling { .. } => VehicleStatus::Dwelling,
            MotionPhase::Finished => VehicleStatus::Idle,
            MotionPhase::Moving if self.events.is_active(EventKind::Breakdown) => {
                VehicleStatus::Breakdown
            }
            MotionPhase::Moving if self.speed_mps <= 0.0 => VehicleStatus::Idle,
            MotionPhase::Moving => VehicleStatus::Moving,
        }
    }

    pub fn is_dwelling(&self) -> bool {
        matches!(self.phase, MotionPhase::Dwelling { .. })
    }

    pub fn to_entity(&self) -> Vehicle {
        Vehicle {
            id: self.id.clone(),
            name: self.name.clone(),
            position: Some(self.position),
            heading: self.heading,
            speed_kmh: self.speed_mps * 3.6,
            status: self.status(),
            capacity_total: self.capacity_total,
            capacity_remaining: self.capacity_remaining,
            route_id: Some(self.route_id.clone()),
        }
    }
}

/// Steps every vehicle forward in simulated time.
#[derive(Debug)]
pub struct SimulationEngine {
    config: SimulationConfig,
    routes: HashMap<String, SimRoute>,
    vehicles: Vec<SimVehicle>,
    zones: ZoneMap,
    scheduler: EventScheduler,
    scheduled: Vec<ScheduledEvent>,
    elapsed: Duration,
}

impl SimulationEngine {
    pub fn new(config: SimulationConfig) -> Self {
        let scheduler = EventScheduler::new(config.seed, config.event_rate_per_sec);
        Self {
            config,
            routes: HashMap::new(),
            vehicles: Vec::new(),
            zones: ZoneMap::default(),
            scheduler,
            scheduled: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn add_route(&mut self, route: SimRoute) {
        self.routes.insert(route.id().to_string(), route);
    }

    pub fn route(&self, id: &str) -> Option<&SimRoute> {
        self.routes.get(id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &SimRoute> {
        self.routes.values()
    }

    pub fn add_zone(&mut self, zone: CongestionZone) {
        self.zones.add(zone);
    }

    pub fn add_vehicle(&mut self, spec: VehicleSpec) -> Result<(), SimulationError> {
        if self.vehicles.iter().any(|v| v.id == spec.id) {
            return Err(SimulationError::DuplicateVehicle(spec.id));
        }
        let route = self
            .routes
            .get(&spec.route_id)
            .ok_or_else(|| SimulationError::UnknownRoute(spec.route_id.clone()))?;
        if !(spec.base_speed_kmh.is_finite() && spec.base_speed_kmh >= 0.0) {
            return Err(SimulationError::InvalidSpeed {
                vehicle_id: spec.id,
                speed_kmh: spec.base_speed_kmh,
            });
        }

        let capacity = if spec.capacity == 0 {
            route.total_load()
        } else {
            spec.capacity
        };
        let (position, heading) = route.path().locate(0.0);
        let mut trail = TrailBuffer::new(self.config.trail_length);
        trail.push(position);

        self.vehicles.push(SimVehicle {
            id: spec.id,
            name: spec.name,
            route_id: spec.route_id,
            base_speed_mps: spec.base_speed_kmh / 3.6,
            distance_m: 0.0,
            capacity_total: capacity,
            capacity_remaining: capacity,
            next_stop: 0,
            phase: MotionPhase::Moving,
            position,
            heading,
            speed_mps: 0.0,
            events: EventSet::default(),
            trail,
            laps: 0,
        });
        Ok(())
    }

    /// Plan an event for a vehicle at simulation time `at`.
    pub fn schedule_event(&mut self, vehicle_id: impl Into<String>, at: Duration, event: ActiveEvent) {
        self.scheduled.push(ScheduledEvent {
            vehicle_id: vehicle_id.into(),
            at,
            event,
        });
    }

    pub fn vehicle(&self, id: &str) -> Option<&SimVehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn sim_vehicles(&self) -> &[SimVehicle] {
        &self.vehicles
    }

    /// Current vehicle entities.
    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.vehicles.iter().map(SimVehicle::to_entity).collect()
    }

    pub fn trails(&self) -> Vec<Trail> {
        self.vehicles.iter().map(|v| v.trail.to_trail(&v.id)).collect()
    }

    /// Advance the simulation by `dt`.
    pub fn step(&mut self, dt: Duration) -> Vec<SimEvent> {
        self.elapsed += dt;
        let mut out = Vec::new();
        self.start_scheduled(&mut out);

        for vehicle in &mut self.vehicles {
            let Some(route) = self.routes.get(&vehicle.route_id) else {
                continue;
            };

            if matches!(vehicle.phase, MotionPhase::Moving) {
                if let Some(event) = self.scheduler.roll(dt) {
                    debug!(vehicle = %vehicle.id, kind = %event.kind, "Random event started");
                    out.push(SimEvent::EventStarted {
                        vehicle_id: vehicle.id.clone(),
                        kind: event.kind,
                        duration: event.remaining,
                    });
                    vehicle.events.start(event);
                }
            }

            advance_vehicle(vehicle, route, &self.zones, &self.config, dt, &mut out);

            for kind in vehicle.events.advance(dt) {
                out.push(SimEvent::EventExpired {
                    vehicle_id: vehicle.id.clone(),
                    kind,
                });
            }
        }

        trace!(elapsed_ms = self.elapsed.as_millis() as u64, events = out.len(), "Simulation step");
        out
    }

    fn start_scheduled(&mut self, out: &mut Vec<SimEvent>) {
        let elapsed = self.elapsed;
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|s| s.at <= elapsed);
        self.scheduled = later;

        for scheduled in due {
            let Some(vehicle) = self.vehicles.iter_mut().find(|v| v.id == scheduled.vehicle_id) else {
                debug!(vehicle = %scheduled.vehicle_id, "Scheduled event for unknown vehicle dropped");
                continue;
            };
            out.push(SimEvent::EventStarted {
                vehicle_id: vehicle.id.clone(),
                kind: scheduled.event.kind,
                duration: scheduled.event.remaining,
            });
            vehicle.events.start(scheduled.event);
        }
    }
}

fn advance_vehicle(
    vehicle: &mut SimVehicle,
    route: &SimRoute,
    zones: &ZoneMap,
    config: &SimulationConfig,
    dt: Duration,
    out: &mut Vec<SimEvent>,
) {
    match vehicle.phase {
        MotionPhase::Finished => {
            vehicle.speed_mps = 0.0;
        }
        MotionPhase::Dwelling {
            stop_index,
            remaining,
        } => {
            vehicle.speed_mps = 0.0;
            let remaining = remaining.saturating_sub(dt);
            if !remaining.is_zero() {
                vehicle.phase = MotionPhase::Dwelling {
                    stop_index,
                    remaining,
                };
                return;
            }

            let delivered = route
                .stops()
                .get(stop_index)
                .map_or(0, |s| s.waypoint.load)
                .min(vehicle.capacity_remaining);
            vehicle.capacity_remaining -= delivered;
            vehicle.next_stop = stop_index + 1;
            vehicle.phase = MotionPhase::Moving;
            debug!(
                vehicle = %vehicle.id,
                stop = stop_index,
                delivered,
                remaining = vehicle.capacity_remaining,
                "Delivery completed"
            );
            out.push(SimEvent::DeliveryCompleted {
                vehicle_id: vehicle.id.clone(),
                stop_index,
                delivered,
                remaining_capacity: vehicle.capacity_remaining,
            });
        }
        MotionPhase::Moving => {
            let speed = vehicle.base_speed_mps
                * zones.multiplier_at(&vehicle.position)
                * vehicle.events.multiplier();
            vehicle.speed_mps = speed;
            let target = vehicle.distance_m + speed * dt.as_secs_f64();

            if let Some(stop) = route.stops().get(vehicle.next_stop) {
                if target >= stop.distance_m {
                    vehicle.distance_m = stop.distance_m;
                    vehicle.phase = MotionPhase::Dwelling {
                        stop_index: vehicle.next_stop,
                        remaining: config.dwell,
                    };
                    relocate(vehicle, route);
                    debug!(vehicle = %vehicle.id, stop = %stop.waypoint.name, "Waypoint reached");
                    out.push(SimEvent::WaypointReached {
                        vehicle_id: vehicle.id.clone(),
                        stop_index: vehicle.next_stop,
                        name: stop.waypoint.name.clone(),
                    });
                    return;
                }
            }

            if target >= route.length_m() {
                match config.completion {
                    RouteCompletion::Loop => {
                        vehicle.distance_m = 0.0;
                        vehicle.next_stop = 0;
                        vehicle.capacity_remaining = vehicle.capacity_total;
                        vehicle.laps += 1;
                        vehicle.trail.clear();
                        out.push(SimEvent::RouteRestarted {
                            vehicle_id: vehicle.id.clone(),
                        });
                    }
                    RouteCompletion::Stop => {
                        vehicle.distance_m = route.length_m();
                        vehicle.phase = MotionPhase::Finished;
                        vehicle.speed_mps = 0.0;
                        out.push(SimEvent::RouteCompleted {
                            vehicle_id: vehicle.id.clone(),
                        });
                    }
                }
            } else {
                vehicle.distance_m = target;
            }
            relocate(vehicle, route);
        }
    }
}

fn relocate(vehicle: &mut SimVehicle, route: &SimRoute) {
    let (position, heading) = route.path().locate(vehicle.distance_m);
    if position != vehicle.position {
        vehicle.trail.push(position);
    }
    vehicle.position = position;
    vehicle.heading = heading;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Waypoint;

    const TICK: Duration = Duration::from_secs(1);

    fn config() -> SimulationConfig {
        SimulationConfig::default()
            .with_dwell(Duration::from_secs(30))
            .with_event_rate(0.0)
    }

    /// Three stops roughly 1.1 km apart.
    fn three_stop_route() -> SimRoute {
        SimRoute::through_waypoints(
            "r1",
            "Three stops",
            LngLat::new(13.40, 52.50),
            vec![
                Waypoint::new("first", LngLat::new(13.40, 52.51), 19),
                Waypoint::new("second", LngLat::new(13.40, 52.52), 17),
                Waypoint::new("third", LngLat::new(13.40, 52.53), 40),
            ],
        )
        .unwrap()
    }

    fn engine_with(completion: RouteCompletion) -> SimulationEngine {
        let mut engine = SimulationEngine::new(config().with_completion(completion));
        engine.add_route(three_stop_route());
        engine
            .add_vehicle(VehicleSpec::new("v1", "r1", 72.0))
            .unwrap();
        engine
    }

    fn run_until(
        engine: &mut SimulationEngine,
        max_steps: usize,
        mut pred: impl FnMut(&SimEvent) -> bool,
    ) -> Option<usize> {
        (1..=max_steps).find(|_| engine.step(TICK).iter().any(&mut pred))
    }

    #[test]
    fn test_waypoint_dwell_then_delivery() {
        let mut engine = engine_with(RouteCompletion::Stop);
        assert_eq!(engine.vehicle("v1").unwrap().capacity_remaining, 76);

        run_until(&mut engine, 500, |e| matches!(e, SimEvent::WaypointReached { stop_index: 0, .. }))
            .expect("first stop reached");
        let v = engine.vehicle("v1").unwrap();
        assert!(v.is_dwelling());
        assert_eq!(v.capacity_remaining, 76);
        let frozen = v.distance_m;

        let mut dwell_ticks = 0;
        loop {
            let events = engine.step(TICK);
            dwell_ticks += 1;
            if events
                .iter()
                .any(|e| matches!(e, SimEvent::DeliveryCompleted { delivered: 19, .. }))
            {
                break;
            }
            assert_eq!(engine.vehicle("v1").unwrap().distance_m, frozen);
            assert_eq!(engine.vehicle("v1").unwrap().status(), VehicleStatus::Dwelling);
        }
        assert_eq!(dwell_ticks, 30);

        let v = engine.vehicle("v1").unwrap();
        assert_eq!(v.capacity_remaining, 76 - 19);
        assert_eq!(v.next_stop, 1);

        engine.step(TICK);
        assert!(engine.vehicle("v1").unwrap().distance_m > frozen);
    }

    #[test]
    fn test_stop_completion_finishes() {
        let mut engine = engine_with(RouteCompletion::Stop);
        run_until(&mut engine, 2_000, |e| matches!(e, SimEvent::RouteCompleted { .. }))
            .expect("route completed");

        let v = engine.vehicle("v1").unwrap();
        assert_eq!(v.capacity_remaining, 0);
        assert_eq!(v.status(), VehicleStatus::Idle);
        assert_eq!(v.to_entity().speed_kmh, 0.0);
    }

    #[test]
    fn test_loop_completion_restarts_with_full_capacity() {
        let mut engine = engine_with(RouteCompletion::Loop);
        run_until(&mut engine, 2_000, |e| matches!(e, SimEvent::RouteRestarted { .. }))
            .expect("route restarted");

        let v = engine.vehicle("v1").unwrap();
        assert_eq!(v.laps, 1);
        assert_eq!(v.capacity_remaining, v.capacity_total);
        assert_eq!(v.next_stop, 0);
    }

    #[test]
    fn test_zone_and_event_multipliers_slow_vehicle() {
        let mut free = engine_with(RouteCompletion::Stop);
        let mut slowed = engine_with(RouteCompletion::Stop);
        slowed.add_zone(CongestionZone::new("city", LngLat::new(13.40, 52.50), 5_000.0, 0.5));
        slowed.schedule_event(
            "v1",
            Duration::ZERO,
            ActiveEvent::new(EventKind::TrafficJam, Duration::from_secs(5)).with_multiplier(0.5),
        );

        for _ in 0..5 {
            free.step(TICK);
            slowed.step(TICK);
        }
        let free_d = free.vehicle("v1").unwrap().distance_m;
        let slowed_d = slowed.vehicle("v1").unwrap().distance_m;
        assert!((slowed_d - free_d * 0.25).abs() < 1e-6);
        assert!(slowed.vehicle("v1").unwrap().events.is_empty());
    }

    #[test]
    fn test_breakdown_stops_motion() {
        let mut engine = engine_with(RouteCompletion::Stop);
        engine.schedule_event(
            "v1",
            Duration::from_secs(2),
            ActiveEvent::new(EventKind::Breakdown, Duration::from_secs(10)),
        );
        engine.step(TICK);
        let events = engine.step(TICK);
        assert!(events
            .iter()
            .any(|e| matches!(e, SimEvent::EventStarted { kind: EventKind::Breakdown, .. })));

        let before = engine.vehicle("v1").unwrap().distance_m;
        engine.step(TICK);
        let v = engine.vehicle("v1").unwrap();
        assert_eq!(v.distance_m, before);
        assert_eq!(v.status(), VehicleStatus::Breakdown);
    }

    #[test]
    fn test_trail_stays_bounded() {
        let mut engine = SimulationEngine::new(config().with_completion(RouteCompletion::Loop));
        engine.add_route(three_stop_route());
        engine.add_vehicle(VehicleSpec::new("v1", "r1", 20.0)).unwrap();

        for _ in 0..120 {
            engine.step(TICK);
        }
        let trail = &engine.trails()[0];
        assert_eq!(trail.points.len(), 50);
        assert_eq!(trail.points.last().map(|p| p.opacity), Some(1.0));
    }

    #[test]
    fn test_add_vehicle_validation() {
        let mut engine = engine_with(RouteCompletion::Stop);
        assert!(matches!(
            engine.add_vehicle(VehicleSpec::new("v1", "r1", 50.0)),
            Err(SimulationError::DuplicateVehicle(_))
        ));
        assert!(matches!(
            engine.add_vehicle(VehicleSpec::new("v2", "nope", 50.0)),
            Err(SimulationError::UnknownRoute(_))
        ));
        assert!(matches!(
            engine.add_vehicle(VehicleSpec::new("v3", "r1", f64::NAN)),
            Err(SimulationError::InvalidSpeed { .. })
        ));
    }
}
