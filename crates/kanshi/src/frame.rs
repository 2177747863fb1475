//! Frame types for raw captured video

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifies a camera in the system.
///
/// Ids are opaque strings, but they are used as directory names under the
/// storage root, so only ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CameraId(String);

impl CameraId {
    /// Maximum accepted id length
    pub const MAX_LEN: usize = 64;

    /// Create a CameraId, validating that it is safe to use as a path component
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= Self::MAX_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(ValidationError::InvalidCameraId(id))
        }
    }

    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CameraId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CameraId> for String {
    fn from(id: CameraId) -> Self {
        id.0
    }
}

/// Frame dimensions in pixels.
///
/// Serialized as `[width, height]` to match the configuration file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of an RGB8 buffer with these dimensions
    pub fn rgb_len(&self) -> usize {
        self.pixel_count() * 3
    }
}

impl From<[u32; 2]> for Resolution {
    fn from([width, height]: [u32; 2]) -> Self {
        Self { width, height }
    }
}

impl From<Resolution> for [u32; 2] {
    fn from(r: Resolution) -> Self {
        [r.width, r.height]
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single raw video frame.
///
/// The pixel buffer is packed RGB8 held in [`Bytes`], so cloning a frame is a
/// reference-count bump and no consumer can mutate pixels another consumer is
/// reading. Transformations such as [`Frame::resized`] produce a new frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Per-camera sequence number, stamped by the frame hub
    pub sequence: u64,
    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
    /// Pixel dimensions
    pub resolution: Resolution,
    /// Packed RGB8 pixels, row-major
    pub data: Bytes,
}

impl Frame {
    /// Create an RGB8 frame captured now
    pub fn rgb(resolution: Resolution, data: Bytes) -> Result<Self, ValidationError> {
        let expected = resolution.rgb_len();
        if data.len() != expected {
            return Err(ValidationError::FrameSize {
                resolution,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            sequence: 0,
            captured_at: Utc::now(),
            resolution,
            data,
        })
    }

    /// Set the sequence number and return self (builder pattern)
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set the capture time and return self (builder pattern)
    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Return a copy scaled to `target` (bilinear), or a cheap clone if the
    /// dimensions already match.
    pub fn resized(&self, target: Resolution) -> Result<Frame> {
        if self.resolution == target {
            return Ok(self.clone());
        }
        let source = image::RgbImage::from_raw(
            self.resolution.width,
            self.resolution.height,
            self.data.to_vec(),
        )
        .context("Frame buffer does not match its resolution")?;
        let scaled = image::imageops::resize(
            &source,
            target.width,
            target.height,
            image::imageops::FilterType::Triangle,
        );
        Ok(Frame {
            sequence: self.sequence,
            captured_at: self.captured_at,
            resolution: target,
            data: Bytes::from(scaled.into_raw()),
        })
    }
}
