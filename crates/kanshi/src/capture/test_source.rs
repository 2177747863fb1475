//! Synthetic capture source and no-op detector
//!
//! Lets the recorder run end to end without cameras or a model: frames are a
//! static gradient with a bright square sweeping across it, so motion scoring
//! has something to see.

use anyhow::{bail, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::info;

use crate::backend::{CaptureBackend, CaptureHandle, Detection, InferenceBackend, ReadOutcome};
use crate::frame::{Frame, Resolution};
use crate::model::CaptureSettings;

/// URI scheme accepted by [`SyntheticCapture`]
pub const SCHEME: &str = "synthetic://";

/// Capture backend producing generated frames for `synthetic://` sources
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    /// Generate at this size instead of the camera's target resolution
    pub resolution: Option<Resolution>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution(resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open(
        &self,
        source_uri: &str,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        if !source_uri.starts_with(SCHEME) {
            bail!("unsupported source {source_uri:?}, expected {SCHEME}...");
        }
        let resolution = self.resolution.unwrap_or(settings.resolution);
        let period = Duration::from_secs_f64(1.0 / f64::from(settings.fps.max(1)));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Synthetic source opened: {}, {} fps",
            resolution, settings.fps
        );
        Ok(Box::new(SyntheticHandle {
            resolution,
            background: gradient(resolution),
            ticker,
            index: 0,
        }))
    }
}

struct SyntheticHandle {
    resolution: Resolution,
    background: Vec<u8>,
    ticker: Interval,
    index: u64,
}

fn gradient(resolution: Resolution) -> Vec<u8> {
    let (w, h) = (resolution.width.max(1), resolution.height.max(1));
    let mut buf = Vec::with_capacity(resolution.rgb_len());
    for y in 0..h {
        for x in 0..w {
            buf.push((x * 255 / w) as u8);
            buf.push((y * 255 / h) as u8);
            buf.push(64);
        }
    }
    buf
}

impl SyntheticHandle {
    fn render(&self) -> Vec<u8> {
        let mut buf = self.background.clone();
        let (w, h) = (self.resolution.width, self.resolution.height);
        let side = (w.min(h) / 6).max(1);
        let span = w.saturating_sub(side).max(1);
        let x0 = ((self.index * 4) % u64::from(span)) as u32;
        let y0 = (h - side) / 2;
        for y in y0..y0 + side {
            for x in x0..(x0 + side).min(w) {
                let i = ((y * w + x) * 3) as usize;
                buf[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        buf
    }
}

#[async_trait::async_trait]
impl CaptureHandle for SyntheticHandle {
    async fn read_frame(&mut self) -> Result<ReadOutcome> {
        self.ticker.tick().await;
        self.index += 1;
        let frame = Frame::rgb(self.resolution, Bytes::from(self.render()))?;
        Ok(ReadOutcome::Frame(frame))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Detector that never finds anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullInference;

#[async_trait::async_trait]
impl InferenceBackend for NullInference {
    fn model_name(&self) -> &str {
        "none"
    }

    async fn detect(
        &self,
        _frame: &Frame,
        _confidence: f32,
        _allowed_labels: &[String],
    ) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
