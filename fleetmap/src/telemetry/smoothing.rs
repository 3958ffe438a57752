//! Threshold-gated position smoothing.
//!
//! A new position for a known entity is reached by easing from wherever the
//! entity is currently drawn, never by jumping. Only a jump larger than the
//! teleport threshold (a reset, a GPS glitch correction, a new route) snaps.
//!
//! ```text
//!  position
//!     ▲            ease-out cubic
//!  to ┤          ___________
//!     │      _--
//!     │    /
//!     │   /
//! from┼──┘
//!     └──┬─────────────┬──────► time
//!      target      + duration
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::geo::LngLat;

/// Jumps larger than this are applied immediately.
pub const DEFAULT_TELEPORT_THRESHOLD_M: f64 = 2_000.0;

/// Time to ease between two reported positions.
pub const DEFAULT_SMOOTHING_DURATION: Duration = Duration::from_millis(1_000);

/// Ease-out cubic: fast start, gentle arrival.
pub fn ease_out_cubic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingConfig {
    pub duration: Duration,
    pub teleport_threshold_m: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_SMOOTHING_DURATION,
            teleport_threshold_m: DEFAULT_TELEPORT_THRESHOLD_M,
        }
    }
}

/// How a new target was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingDecision {
    /// First sighting, placed directly.
    First,
    /// Beyond the teleport threshold, placed directly.
    Snap,
    /// Easing toward the new target.
    Animate,
    /// Same target as before.
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct Track {
    from: LngLat,
    to: LngLat,
    started: Instant,
    settled: bool,
}

impl Track {
    fn at_rest(position: LngLat, now: Instant) -> Self {
        Self {
            from: position,
            to: position,
            started: now,
            settled: true,
        }
    }

    fn position_at(&self, now: Instant, duration: Duration) -> LngLat {
        let elapsed = now.saturating_duration_since(self.started);
        if self.settled || elapsed >= duration {
            return self.to;
        }
        let t = elapsed.as_secs_f64() / duration.as_secs_f64();
        self.from.lerp(&self.to, ease_out_cubic(t))
    }
}

/// Per-entity easing state.
#[derive(Debug, Default)]
pub struct PositionSmoother {
    config: SmoothingConfig,
    tracks: HashMap<String, Track>,
}

impl PositionSmoother {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
        }
    }

    /// Set a new target for an entity.
    pub fn target(&mut self, id: &str, position: LngLat, now: Instant) -> SmoothingDecision {
        let duration = self.config.duration;
        let Some(track) = self.tracks.get_mut(id) else {
            self.tracks.insert(id.to_string(), Track::at_rest(position, now));
            return SmoothingDecision::First;
        };

        if track.to == position {
            return SmoothingDecision::Unchanged;
        }

        let current = track.position_at(now, duration);
        if current.distance_m(&position) > self.config.teleport_threshold_m {
            *track = Track::at_rest(position, now);
            return SmoothingDecision::Snap;
        }

        *track = Track {
            from: current,
            to: position,
            started: now,
            settled: false,
        };
        SmoothingDecision::Animate
    }

    /// Where the entity should be drawn now.
    pub fn position_at(&self, id: &str, now: Instant) -> Option<LngLat> {
        self.tracks
            .get(id)
            .map(|t| t.position_at(now, self.config.duration))
    }

    /// Positions of every animating entity; settles finished tracks.
    pub fn advance(&mut self, now: Instant) -> Vec<(String, LngLat)> {
        let duration = self.config.duration;
        let mut frame = Vec::new();
        for (id, track) in self.tracks.iter_mut().filter(|(_, t)| !t.settled) {
            frame.push((id.clone(), track.position_at(now, duration)));
            if now.saturating_duration_since(track.started) >= duration {
                track.settled = true;
            }
        }
        frame.sort_by(|a, b| a.0.cmp(&b.0));
        frame
    }

    pub fn is_animating(&self) -> bool {
        self.tracks.values().any(|t| !t.settled)
    }

    pub fn remove(&mut self, id: &str) {
        self.tracks.remove(id);
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
