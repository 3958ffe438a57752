//! Bounded per-vehicle path history.

use std::collections::VecDeque;

use crate::entities::{Trail, TrailPoint};
use crate::geo::LngLat;

/// Default number of points kept per vehicle.
pub const DEFAULT_TRAIL_LENGTH: usize = 50;

/// Recent positions of one vehicle, oldest first.
///
/// Pushing onto a full buffer evicts the oldest point.
#[derive(Debug, Clone)]
pub struct TrailBuffer {
    points: VecDeque<LngLat>,
    capacity: usize,
}

impl Default for TrailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TRAIL_LENGTH)
    }
}

impl TrailBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, position: LngLat) {
        if !position.is_valid() {
            return;
        }
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(position);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest retained point.
    pub fn head(&self) -> Option<LngLat> {
        self.points.front().copied()
    }

    pub fn latest(&self) -> Option<LngLat> {
        self.points.back().copied()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Snapshot with recency fade: the newest point is fully opaque and the
    /// opacity falls linearly towards the oldest.
    pub fn to_trail(&self, vehicle_id: &str) -> Trail {
        let n = self.points.len() as f64;
        let points = self
            .points
            .iter()
            .enumerate()
            .map(|(i, &position)| TrailPoint {
                position,
                opacity: (i + 1) as f64 / n,
            })
            .collect();
        Trail {
            vehicle_id: vehicle_id.to_string(),
            points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_with_oldest_at_head() {
        let mut trail = TrailBuffer::default();
        for i in 0..75 {
            trail.push(LngLat::new(0.0, i as f64 * 0.001));
            assert!(trail.len() <= DEFAULT_TRAIL_LENGTH);
        }

        assert_eq!(trail.len(), 50);
        assert_eq!(trail.head(), Some(LngLat::new(0.0, 25.0 * 0.001)));
        assert_eq!(trail.latest(), Some(LngLat::new(0.0, 74.0 * 0.001)));
    }

    #[test]
    fn test_fade_increases_towards_newest() {
        let mut trail = TrailBuffer::new(4);
        for i in 0..4 {
            trail.push(LngLat::new(i as f64, 0.0));
        }
        let opacities: Vec<f64> = trail.to_trail("v1").points.iter().map(|p| p.opacity).collect();
        assert_eq!(opacities, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_invalid_points_are_ignored() {
        let mut trail = TrailBuffer::new(3);
        trail.push(LngLat::new(f64::NAN, 0.0));
        assert!(trail.is_empty());
    }
}
