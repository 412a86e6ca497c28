//! Rate limiters used by the heartbeat, presence and cursor paths.
//!
//! All limiters take the current [`Instant`] from the caller, so timing
//! behavior is deterministic under test.

use std::time::{Duration, Instant};

use crate::cursor::Point;

/// Admits at most one event per `interval`.
///
/// The first event is always admitted.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    interval: Duration,
    last: Option<Instant>,
}

impl FixedWindow {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Whether an event at `now` would be admitted, without consuming it.
    pub fn ready(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Admit and record an event at `now`, or reject it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.ready(now) {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    /// Record an event unconditionally (e.g. a forced broadcast).
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Forget history; the next event is admitted.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Instant at which the next event becomes admissible.
    pub fn next_ready(&self) -> Option<Instant> {
        self.last.map(|last| last + self.interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Combined distance + time gate for pointer sampling.
///
/// A sample passes only if it moved at least `min_distance` from the last
/// admitted sample AND the time window has elapsed. Neither alone suffices.
#[derive(Debug, Clone)]
pub struct MovementThrottle {
    min_distance: f64,
    window: FixedWindow,
    last_sent: Option<Point>,
}

impl MovementThrottle {
    pub fn new(min_distance: f64, min_interval: Duration) -> Self {
        Self {
            min_distance,
            window: FixedWindow::new(min_interval),
            last_sent: None,
        }
    }

    pub fn admit(&mut self, position: Point, now: Instant) -> bool {
        let far_enough = match self.last_sent {
            None => true,
            Some(last) => last.distance(&position) >= self.min_distance,
        };
        if !far_enough || !self.window.ready(now) {
            return false;
        }
        self.window.mark(now);
        self.last_sent = Some(position);
        true
    }

    pub fn reset(&mut self) {
        self.window.reset();
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window_first_event_admitted() {
        let mut w = FixedWindow::new(Duration::from_secs(1));
        assert!(w.try_acquire(Instant::now()));
    }

    #[test]
    fn test_fixed_window_spacing() {
        let t0 = Instant::now();
        let mut w = FixedWindow::new(Duration::from_millis(100));
        assert!(w.try_acquire(t0));
        assert!(!w.try_acquire(t0 + Duration::from_millis(99)));
        assert!(w.try_acquire(t0 + Duration::from_millis(100)));
        assert_eq!(w.next_ready(), Some(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_fixed_window_reset() {
        let t0 = Instant::now();
        let mut w = FixedWindow::new(Duration::from_secs(60));
        w.mark(t0);
        assert!(!w.ready(t0));
        w.reset();
        assert!(w.ready(t0));
    }

    #[test]
    fn test_movement_requires_distance_and_time() {
        let t0 = Instant::now();
        let mut m = MovementThrottle::new(5.0, Duration::from_millis(50));

        assert!(m.admit(Point::new(0.0, 0.0), t0));
        // enough time, not enough distance
        assert!(!m.admit(Point::new(3.0, 0.0), t0 + Duration::from_millis(200)));
        // enough distance, not enough time
        assert!(!m.admit(Point::new(30.0, 0.0), t0 + Duration::from_millis(10)));
        // both
        assert!(m.admit(Point::new(3.0, 4.0), t0 + Duration::from_millis(60)));
    }

    #[test]
    fn test_movement_distance_measured_from_last_admitted() {
        let t0 = Instant::now();
        let mut m = MovementThrottle::new(5.0, Duration::from_millis(50));
        assert!(m.admit(Point::new(0.0, 0.0), t0));
        // rejected samples do not move the reference point
        assert!(!m.admit(Point::new(4.0, 0.0), t0 + Duration::from_millis(100)));
        assert!(m.admit(Point::new(5.0, 0.0), t0 + Duration::from_millis(100)));
    }
}
