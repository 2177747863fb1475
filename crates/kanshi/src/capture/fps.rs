//! Frame-rate measurement
//!
//! Counts frames and recomputes the rate once per window of
//! [`FpsMeter::WINDOW`] frames, so the reading is stable and cheap to update
//! on every frame.

use tokio::time::Instant;

pub struct FpsMeter {
    window_start: Option<Instant>,
    frames_in_window: u32,
    fps: f64,
}

impl FpsMeter {
    /// Frames per measurement window
    pub const WINDOW: u32 = 30;

    pub fn new() -> Self {
        Self {
            window_start: None,
            frames_in_window: 0,
            fps: 0.0,
        }
    }

    /// Count one frame. Returns the new reading when a window completes.
    pub fn record(&mut self) -> Option<f64> {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.frames_in_window += 1;
        if self.frames_in_window < Self::WINDOW {
            return None;
        }

        let elapsed = now.duration_since(start).as_secs_f64();
        if elapsed > 0.0 {
            self.fps = f64::from(self.frames_in_window) / elapsed;
        }
        self.window_start = Some(now);
        self.frames_in_window = 0;
        Some(self.fps)
    }

    /// Last completed reading (0.0 before the first window)
    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}
