//! Vehicle movement simulation.
//!
//! The simulation produces vehicle telemetry the same way a live backend
//! does, so the whole pipeline can run without one.
//!
//! - [`SimRoute`] - distance-indexed path with delivery stops
//! - [`ZoneMap`] - congestion lookup by position
//! - [`EventScheduler`] / [`EventSet`] - timed speed-changing events
//! - [`TrailBuffer`] - bounded path history with recency fade
//! - [`SimulationEngine`] - the per-tick physics
//! - [`SimulationSource`] - the engine as a [`RealtimeSource`](crate::telemetry::RealtimeSource)

mod engine;
mod events;
mod route;
mod scenario;
mod source;
mod trail;
mod zones;

pub use engine::{MotionPhase, SimEvent, SimVehicle, SimulationEngine, VehicleSpec};
pub use events::{
    ActiveEvent, EventKind, EventScheduler, EventSet, ScheduledEvent, DEFAULT_EVENT_RATE_PER_SEC,
};
pub use route::{RouteStop, SimRoute, Waypoint};
pub use scenario::demo_scenario;
pub use source::{SimulationSource, SIM_EVENT_CAPACITY};
pub use trail::{TrailBuffer, DEFAULT_TRAIL_LENGTH};
pub use zones::{CongestionZone, ZoneMap};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default wall-clock interval between ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1_000);

/// Default dwell at a stop.
pub const DEFAULT_DWELL: Duration = Duration::from_secs(30);

/// Default seed for random events.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("Invalid route {route_id}: {reason}")]
    InvalidRoute { route_id: String, reason: String },

    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("Vehicle {0} already exists")]
    DuplicateVehicle(String),

    #[error("Invalid speed {speed_kmh} km/h for vehicle {vehicle_id}")]
    InvalidSpeed { vehicle_id: String, speed_kmh: f64 },

    #[error("Unknown route completion mode: {0}")]
    UnknownCompletion(String),
}

/// What a vehicle does at the end of its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteCompletion {
    /// Start over with full capacity.
    #[default]
    Loop,
    /// Park at the last stop.
    Stop,
}

impl fmt::Display for RouteCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteCompletion::Loop => f.write_str("loop"),
            RouteCompletion::Stop => f.write_str("stop"),
        }
    }
}

impl FromStr for RouteCompletion {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loop" => Ok(RouteCompletion::Loop),
            "stop" => Ok(RouteCompletion::Stop),
            other => Err(SimulationError::UnknownCompletion(other.to_string())),
        }
    }
}

/// Simulation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Wall-clock time between ticks.
    pub tick: Duration,
    /// Simulated seconds per wall-clock second.
    pub time_scale: f64,
    pub dwell: Duration,
    pub trail_length: usize,
    pub seed: u64,
    /// Chance per vehicle per simulated second of a random event.
    pub event_rate_per_sec: f64,
    pub completion: RouteCompletion,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            time_scale: 1.0,
            dwell: DEFAULT_DWELL,
            trail_length: DEFAULT_TRAIL_LENGTH,
            seed: DEFAULT_SEED,
            event_rate_per_sec: DEFAULT_EVENT_RATE_PER_SEC,
            completion: RouteCompletion::default(),
        }
    }
}

impl SimulationConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        self
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn with_trail_length(mut self, length: usize) -> Self {
        self.trail_length = length.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_event_rate(mut self, rate_per_sec: f64) -> Self {
        self.event_rate_per_sec = rate_per_sec.max(0.0);
        self
    }

    pub fn with_completion(mut self, completion: RouteCompletion) -> Self {
        self.completion = completion;
        self
    }
}
