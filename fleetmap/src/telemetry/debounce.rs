//! Per-source debounce with cancel-and-restart semantics.
//!
//! Every push restarts the quiet-period timer. Entities pushed during the
//! window are merged by id, keeping the newest value, so a burst becomes a
//! single update once the source goes quiet.

use std::time::Duration;

use tokio::time::Instant;

use super::TelemetryEntity;

/// Debounce window for fast-moving entities.
pub const FAST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Debounce window for near-static topology.
pub const TOPOLOGY_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Pending entities plus an owned deadline.
#[derive(Debug)]
pub struct Debouncer<E> {
    window: Duration,
    pending: Vec<E>,
    deadline: Option<Instant>,
    restarts: u64,
}

impl<E: TelemetryEntity> Debouncer<E> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
            restarts: 0,
        }
    }

    /// Merge items and restart the timer.
    pub fn push(&mut self, items: Vec<E>, now: Instant) {
        if items.is_empty() {
            return;
        }
        for item in items {
            match self
                .pending
                .iter_mut()
                .find(|p| p.entity_id() == item.entity_id())
            {
                Some(existing) => *existing = item,
                None => self.pending.push(item),
            }
        }
        if self.deadline.is_some() {
            self.restarts += 1;
        }
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Take the merged items if the quiet period has elapsed.
    pub fn take_if_due(&mut self, now: Instant) -> Option<Vec<E>> {
        if self.is_due(now) {
            Some(self.take())
        } else {
            None
        }
    }

    /// Take the merged items regardless of the deadline.
    pub fn take(&mut self) -> Vec<E> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Times the timer was restarted before firing.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Vehicle, VehicleStatus};
    use crate::geo::LngLat;

    fn vehicle(id: &str, lng: f64) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: id.to_string(),
            position: Some(LngLat::new(lng, 0.0)),
            heading: 0.0,
            speed_kmh: 0.0,
            status: VehicleStatus::Moving,
            capacity_total: 0,
            capacity_remaining: 0,
            route_id: None,
        }
    }

    #[test]
    fn test_push_restarts_timer() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        debouncer.push(vec![vehicle("v1", 0.0)], start);
        debouncer.push(vec![vehicle("v1", 1.0)], start + Duration::from_millis(80));

        assert!(!debouncer.is_due(start + Duration::from_millis(150)));
        assert!(debouncer.is_due(start + Duration::from_millis(180)));
        assert_eq!(debouncer.restarts(), 1);
    }

    #[test]
    fn test_merges_keep_last_by_id() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.push(vec![vehicle("v1", 0.0), vehicle("v2", 0.0)], now);
        debouncer.push(vec![vehicle("v1", 5.0)], now);

        let items = debouncer.take_if_due(now + Duration::from_millis(100)).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "v1");
        assert_eq!(items[0].position.unwrap().lng, 5.0);
        assert!(debouncer.deadline().is_none());
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[test]
    fn test_not_due_returns_none() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(FAST_DEBOUNCE);
        assert!(debouncer.take_if_due(now).is_none());
        debouncer.push(vec![vehicle("v1", 0.0)], now);
        assert!(debouncer.take_if_due(now).is_none());
        assert_eq!(debouncer.pending_len(), 1);
    }

    #[test]
    fn test_empty_push_does_not_arm() {
        let mut debouncer: Debouncer<Vehicle> = Debouncer::new(TOPOLOGY_DEBOUNCE);
        debouncer.push(Vec::new(), Instant::now());
        assert!(debouncer.deadline().is_none());
    }
}
