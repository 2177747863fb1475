//! Frame-differencing motion detector
//!
//! Compares the luma of consecutive sampled frames: pixels whose luma changed
//! by more than `pixel_threshold` count as changed. Fewer than `min_area`
//! changed pixels is noise. Otherwise the score is the changed fraction of the
//! frame, and motion is reported when it exceeds `sensitivity`.

use serde::Serialize;

use crate::frame::{Frame, Resolution};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    pub pixel_threshold: u8,
    pub min_area: u32,
    pub sensitivity: f32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            pixel_threshold: 25,
            min_area: 500,
            sensitivity: 0.02,
        }
    }
}

/// Result of comparing one frame with the previous one
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionReading {
    pub changed_pixels: u32,
    /// Changed fraction of the frame, 0.0 when below `min_area`
    pub score: f32,
    pub motion: bool,
}

pub struct MotionDetector {
    settings: MotionSettings,
    previous: Option<(Resolution, Vec<u8>)>,
}

/// Rec. 601 luma of packed RGB8
fn luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|p| (0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2])) as u8)
        .collect()
}

impl MotionDetector {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            previous: None,
        }
    }

    /// Compare `frame` with the previous frame and keep it as the new
    /// reference. Returns `None` for the first frame and after a resolution
    /// change.
    pub fn update(&mut self, frame: &Frame) -> Option<MotionReading> {
        let current = luma(&frame.data);
        let previous = self.previous.replace((frame.resolution, current));
        let (prev_res, prev_luma) = previous?;
        if prev_res != frame.resolution {
            return None;
        }
        let (_, current) = self.previous.as_ref()?;

        let threshold = self.settings.pixel_threshold;
        let changed = prev_luma
            .iter()
            .zip(current.iter())
            .filter(|(a, b)| a.abs_diff(**b) > threshold)
            .count() as u32;

        let total = frame.resolution.pixel_count().max(1) as f32;
        let score = if changed < self.settings.min_area {
            0.0
        } else {
            changed as f32 / total
        };
        Some(MotionReading {
            changed_pixels: changed,
            score,
            motion: score > self.settings.sensitivity,
        })
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(res: Resolution, paint: impl Fn(u32, u32) -> u8) -> Frame {
        let mut data = Vec::with_capacity(res.rgb_len());
        for y in 0..res.height {
            for x in 0..res.width {
                let v = paint(x, y);
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::rgb(res, Bytes::from(data)).unwrap()
    }

    #[test]
    fn first_frame_has_no_reading() {
        let mut d = MotionDetector::new(MotionSettings::default());
        assert!(d.update(&frame(Resolution::new(8, 8), |_, _| 0)).is_none());
    }

    #[test]
    fn static_scene_has_no_motion() {
        let res = Resolution::new(100, 100);
        let mut d = MotionDetector::new(MotionSettings::default());
        d.update(&frame(res, |x, _| x as u8));
        let r = d.update(&frame(res, |x, _| x as u8)).unwrap();
        assert_eq!(r.changed_pixels, 0);
        assert!(!r.motion);
    }

    #[test]
    fn moving_block_is_motion() {
        let res = Resolution::new(100, 100);
        let mut d = MotionDetector::new(MotionSettings::default());
        d.update(&frame(res, |_, _| 10));
        // 40x40 bright block = 1600 changed pixels, 16% of the frame
        let r = d
            .update(&frame(res, |x, y| if x < 40 && y < 40 { 200 } else { 10 }))
            .unwrap();
        assert_eq!(r.changed_pixels, 1600);
        assert!((r.score - 0.16).abs() < 1e-6);
        assert!(r.motion);
    }

    #[test]
    fn small_changes_are_noise() {
        let res = Resolution::new(100, 100);
        let mut d = MotionDetector::new(MotionSettings::default());
        d.update(&frame(res, |_, _| 10));
        // 20x20 = 400 changed pixels, below min_area
        let r = d
            .update(&frame(res, |x, y| if x < 20 && y < 20 { 200 } else { 10 }))
            .unwrap();
        assert_eq!(r.changed_pixels, 400);
        assert_eq!(r.score, 0.0);
        assert!(!r.motion);
    }

    #[test]
    fn resolution_change_resets_reference() {
        let mut d = MotionDetector::new(MotionSettings::default());
        d.update(&frame(Resolution::new(10, 10), |_, _| 0));
        assert!(d.update(&frame(Resolution::new(20, 10), |_, _| 255)).is_none());
        assert!(d.update(&frame(Resolution::new(20, 10), |_, _| 255)).is_some());
    }
}
