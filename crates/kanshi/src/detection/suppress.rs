//! Repeated-event suppression
//!
//! An event for `(camera, label)` is emitted at most once per window. Hits
//! inside the window are dropped without extending it, so a label that is
//! seen continuously still emits once per window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::CameraId;

pub struct Suppressor {
    window: Duration,
    last_emitted: HashMap<(CameraId, String), Instant>,
}

impl Suppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` if an event for `(camera, label)` at `now` should be
    /// emitted, and records it. A hit exactly one window after the last
    /// emission is emitted.
    pub fn admit(&mut self, camera: &CameraId, label: &str, now: Instant) -> bool {
        let key = (camera.clone(), label.to_string());
        match self.last_emitted.get(&key) {
            Some(&last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_emitted.insert(key, now);
                true
            }
        }
    }

    /// Forget entries whose window has passed
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_emitted
            .retain(|_, &mut last| now.saturating_duration_since(last) < window);
    }

    pub fn tracked(&self) -> usize {
        self.last_emitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cam(id: &str) -> CameraId {
        CameraId::new(id).unwrap()
    }

    #[test]
    fn window_of_five_seconds() {
        let mut s = Suppressor::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let at = |secs| t0 + Duration::from_secs(secs);
        let porch = cam("porch");

        assert!(s.admit(&porch, "person", at(0)));
        assert!(!s.admit(&porch, "person", at(3)));
        assert!(s.admit(&porch, "person", at(6)));
    }

    #[test]
    fn boundary_is_emitted_and_suppressed_hits_do_not_extend() {
        let mut s = Suppressor::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let porch = cam("porch");

        assert!(s.admit(&porch, "car", t0));
        assert!(!s.admit(&porch, "car", t0 + Duration::from_secs(4)));
        assert!(s.admit(&porch, "car", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn keys_are_independent() {
        let mut s = Suppressor::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(s.admit(&cam("a"), "person", t0));
        assert!(s.admit(&cam("a"), "car", t0));
        assert!(s.admit(&cam("b"), "person", t0));
        assert_eq!(s.tracked(), 3);

        s.prune(t0 + Duration::from_secs(10));
        assert_eq!(s.tracked(), 0);
    }
}
