//! Backend traits for the external collaborators: capture, segment writing
//! and inference.
//!
//! Every method is a suspension point; implementations are expected to bound
//! their own blocking (device timeouts, encoder flushes) and never hold locks
//! shared with other cameras.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, Resolution};
use crate::model::{BoundingBox, CaptureSettings};

/// Result of a single capture read
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame arrived
    Frame(Frame),
    /// The source ended cleanly (file finished, stream closed by peer)
    EndOfStream,
}

/// Opens capture sessions for a camera source.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open `source_uri` with the camera's capture settings
    async fn open(
        &self,
        source_uri: &str,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>>;
}

/// An open capture session.
#[async_trait::async_trait]
pub trait CaptureHandle: Send {
    /// Pull the next raw frame
    async fn read_frame(&mut self) -> Result<ReadOutcome>;

    /// Release the session
    async fn close(&mut self) -> Result<()>;
}

/// Target parameters for a new segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub fps: u32,
    pub resolution: Resolution,
    pub codec: String,
    /// kbit/s
    pub bitrate: u32,
}

impl From<&CaptureSettings> for SegmentSpec {
    fn from(s: &CaptureSettings) -> Self {
        Self {
            fps: s.fps,
            resolution: s.resolution,
            codec: s.codec.clone(),
            bitrate: s.bitrate,
        }
    }
}

/// Creates segment files.
#[async_trait::async_trait]
pub trait SegmentWriterBackend: Send + Sync {
    /// File extension (without dot) of segments this backend produces
    fn extension(&self) -> &str;

    /// Create a new segment at `path`. Parent directories already exist.
    async fn open_segment(&self, path: &Path, spec: &SegmentSpec)
        -> Result<Box<dyn SegmentWriter>>;
}

/// An open segment file.
#[async_trait::async_trait]
pub trait SegmentWriter: Send {
    /// Append a frame already scaled to the segment resolution
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Finalize the file and return its size in bytes
    async fn close(&mut self) -> Result<u64>;
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Object-detection model.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model identifier for status reporting
    fn model_name(&self) -> &str;

    /// Detect objects in `frame`. Implementations may pre-filter by
    /// `confidence` and `allowed_labels`; callers filter again regardless.
    async fn detect(
        &self,
        frame: &Frame,
        confidence: f32,
        allowed_labels: &[String],
    ) -> Result<Vec<Detection>>;
}
