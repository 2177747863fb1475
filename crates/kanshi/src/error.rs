//! Typed errors for the places where callers need to branch on the cause.
//!
//! Everything else (backend I/O, task plumbing) uses `anyhow`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::frame::{CameraId, Resolution};
use crate::model::RecordingId;

/// A value failed a construction-time invariant and was never persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid camera id {0:?}: expected 1-64 ASCII alphanumerics, '-' or '_'")]
    InvalidCameraId(String),

    #[error("camera name must not be empty")]
    EmptyName,

    #[error("camera source URI must not be empty")]
    EmptySourceUri,

    #[error("invalid capture settings: {0}")]
    CaptureSettings(String),

    #[error("end time {end} is not after start time {start}")]
    NonPositiveInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("end time {end} is before start time {start}")]
    NegativeInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("confidence {0} is outside [0, 1]")]
    Confidence(f32),

    #[error("frame buffer is {actual} bytes, expected {expected} for {resolution}")]
    FrameSize {
        resolution: Resolution,
        expected: usize,
        actual: usize,
    },
}

/// Catalog operation failures.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("camera {0} does not exist")]
    UnknownCamera(CameraId),

    #[error("recording {0} does not overlap the event interval")]
    RecordingMismatch(RecordingId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("catalog backend error: {0}")]
    Backend(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound { .. })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        CatalogError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Backend(format!("serialization: {e}"))
    }
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
