//! Timed events that change a vehicle's speed.
//!
//! Active events multiply together, so a traffic jam during a breakdown is
//! still a standstill. Each event expires on its own and is dropped from
//! the active set once its duration has elapsed.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Default chance per vehicle per second of a random event starting.
pub const DEFAULT_EVENT_RATE_PER_SEC: f64 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TrafficJam,
    Breakdown,
    Stop,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::TrafficJam, EventKind::Breakdown, EventKind::Stop];

    /// Speed factor while the event is active.
    pub fn default_multiplier(self) -> f64 {
        match self {
            EventKind::TrafficJam => 0.3,
            EventKind::Breakdown | EventKind::Stop => 0.0,
        }
    }

    pub fn default_duration(self) -> Duration {
        match self {
            EventKind::TrafficJam => Duration::from_secs(90),
            EventKind::Breakdown => Duration::from_secs(300),
            EventKind::Stop => Duration::from_secs(45),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TrafficJam => "traffic_jam",
            EventKind::Breakdown => "breakdown",
            EventKind::Stop => "stop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event in effect on one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEvent {
    pub kind: EventKind,
    pub multiplier: f64,
    pub remaining: Duration,
}

impl ActiveEvent {
    pub fn new(kind: EventKind, duration: Duration) -> Self {
        Self {
            kind,
            multiplier: kind.default_multiplier(),
            remaining: duration,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(0.0);
        self
    }
}

/// The active events of one vehicle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSet {
    active: Vec<ActiveEvent>,
}

impl EventSet {
    pub fn start(&mut self, event: ActiveEvent) {
        self.active.push(event);
    }

    /// Product of all active multipliers; 1.0 when none are active.
    pub fn multiplier(&self) -> f64 {
        self.active.iter().map(|e| e.multiplier).product()
    }

    pub fn is_active(&self, kind: EventKind) -> bool {
        self.active.iter().any(|e| e.kind == kind)
    }

    pub fn active(&self) -> &[ActiveEvent] {
        &self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Age every event by `dt` and return the kinds that expired.
    pub fn advance(&mut self, dt: Duration) -> Vec<EventKind> {
        let mut expired = Vec::new();
        self.active.retain_mut(|event| {
            event.remaining = event.remaining.saturating_sub(dt);
            if event.remaining.is_zero() {
                expired.push(event.kind);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

/// Random event generator, reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct EventScheduler {
    rng: StdRng,
    rate_per_sec: f64,
}

impl EventScheduler {
    pub fn new(seed: u64, rate_per_sec: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            rate_per_sec: rate_per_sec.max(0.0),
        }
    }

    /// No random events.
    pub fn disabled() -> Self {
        Self::new(0, 0.0)
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// Roll for a new event over a tick of length `dt`.
    pub fn roll(&mut self, dt: Duration) -> Option<ActiveEvent> {
        if self.rate_per_sec <= 0.0 {
            return None;
        }
        let chance = (self.rate_per_sec * dt.as_secs_f64()).min(1.0);
        if self.rng.random::<f64>() >= chance {
            return None;
        }

        let kind = EventKind::ALL[self.rng.random_range(0..EventKind::ALL.len())];
        let base = kind.default_duration().as_secs_f64();
        let duration = Duration::from_secs_f64(base * self.rng.random_range(0.5..1.5));
        Some(ActiveEvent::new(kind, duration))
    }
}

/// An event planned for a vehicle at a simulation time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub vehicle_id: String,
    /// Simulation time at which the event starts.
    pub at: Duration,
    pub event: ActiveEvent,
}
