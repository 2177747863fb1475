//! Catalog entities: cameras, recordings and events
//!
//! `New*` types are validated at construction; a value that exists is one the
//! catalog is allowed to persist.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::frame::{CameraId, Resolution};

/// Per-camera capture target: what the segmenter records at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSettings {
    /// Target frames per second
    pub fps: u32,
    /// Target resolution, `[width, height]`
    pub resolution: Resolution,
    /// Codec name handed to the segment writer
    pub codec: String,
    /// Target bitrate in kbit/s
    pub bitrate: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fps: 15,
            resolution: Resolution::new(1920, 1080),
            codec: "h264".to_string(),
            bitrate: 2000,
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fps == 0 || self.fps > 240 {
            return Err(ValidationError::CaptureSettings(format!(
                "fps must be in 1..=240, got {}",
                self.fps
            )));
        }
        let Resolution { width, height } = self.resolution;
        if width == 0 || height == 0 || width > 8192 || height > 8192 {
            return Err(ValidationError::CaptureSettings(format!(
                "resolution {} out of range",
                self.resolution
            )));
        }
        if self.codec.trim().is_empty() {
            return Err(ValidationError::CaptureSettings(
                "codec must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A configured camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    pub name: String,
    pub source_uri: String,
    pub enabled: bool,
    pub settings: CaptureSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to add a camera.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewCamera {
    /// Explicit id; generated when absent
    #[serde(default)]
    pub id: Option<CameraId>,
    pub name: String,
    pub source_uri: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capture settings; the configured defaults are used when absent
    #[serde(default)]
    pub settings: Option<CaptureSettings>,
}

fn default_enabled() -> bool {
    true
}

impl NewCamera {
    pub fn new(name: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            source_uri: source_uri.into(),
            enabled: true,
            settings: None,
        }
    }

    pub fn with_id(mut self, id: CameraId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate and materialize, filling in the id and timestamps.
    pub fn into_camera(
        self,
        defaults: &CaptureSettings,
        now: DateTime<Utc>,
    ) -> Result<Camera, ValidationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let source_uri = self.source_uri.trim().to_string();
        if source_uri.is_empty() {
            return Err(ValidationError::EmptySourceUri);
        }
        let settings = self.settings.unwrap_or_else(|| defaults.clone());
        settings.validate()?;
        Ok(Camera {
            id: self.id.unwrap_or_else(CameraId::generate),
            name,
            source_uri,
            enabled: self.enabled,
            settings,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of a camera; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraUpdate {
    pub name: Option<String>,
    pub source_uri: Option<String>,
    pub enabled: Option<bool>,
    pub settings: Option<CaptureSettings>,
}

impl CameraUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    /// Apply to `camera`, returning the updated copy.
    pub fn apply(&self, camera: &Camera, now: DateTime<Utc>) -> Result<Camera, ValidationError> {
        let mut updated = camera.clone();
        if let Some(name) = &self.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ValidationError::EmptyName);
            }
            updated.name = name.to_string();
        }
        if let Some(uri) = &self.source_uri {
            let uri = uri.trim();
            if uri.is_empty() {
                return Err(ValidationError::EmptySourceUri);
            }
            updated.source_uri = uri.to_string();
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(settings) = &self.settings {
            settings.validate()?;
            updated.settings = settings.clone();
        }
        updated.updated_at = now;
        Ok(updated)
    }
}

/// Catalog row id of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(pub i64);

impl std::fmt::Display for RecordingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog row id of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed segment ready to be registered.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecording {
    camera_id: CameraId,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    file_path: PathBuf,
    file_size_bytes: u64,
    event_based: bool,
    motion_score: Option<f32>,
    created_at: DateTime<Utc>,
}

impl NewRecording {
    /// Validate a closed segment. `end_time` must be strictly after `start_time`.
    ///
    /// `created_at` defaults to `end_time` (the moment the segment closed).
    pub fn new(
        camera_id: CameraId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        file_path: PathBuf,
        file_size_bytes: u64,
        event_based: bool,
    ) -> Result<Self, ValidationError> {
        if end_time <= start_time {
            return Err(ValidationError::NonPositiveInterval {
                start: start_time,
                end: end_time,
            });
        }
        Ok(Self {
            camera_id,
            start_time,
            end_time,
            file_path,
            file_size_bytes,
            event_based,
            motion_score: None,
            created_at: end_time,
        })
    }

    pub fn with_motion_score(mut self, score: Option<f32>) -> Self {
        self.motion_score = score;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes
    }

    pub fn event_based(&self) -> bool {
        self.event_based
    }

    pub fn motion_score(&self) -> Option<f32> {
        self.motion_score
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or_default()
    }

    /// Attach the catalog id
    pub fn into_recording(self, id: RecordingId) -> Recording {
        let duration_secs = self.duration().as_secs_f64();
        Recording {
            id,
            camera_id: self.camera_id,
            start_time: self.start_time,
            end_time: self.end_time,
            file_path: self.file_path,
            file_size_bytes: self.file_size_bytes,
            duration_secs,
            event_based: self.event_based,
            motion_score: self.motion_score,
            created_at: self.created_at,
        }
    }
}

/// A registered segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub camera_id: CameraId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub duration_secs: f64,
    pub event_based: bool,
    pub motion_score: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl Recording {
    /// Closed-interval overlap with `[start, end]`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time <= end && start <= self.end_time
    }
}

/// What produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Motion,
    ObjectDetection,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Motion => "motion",
            EventKind::ObjectDetection => "object_detection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "motion" => Some(EventKind::Motion),
            "object_detection" => Some(EventKind::ObjectDetection),
            _ => None,
        }
    }
}

/// Axis-aligned box in source-frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Structured event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
    /// Box area for detections, changed-pixel count for motion
    pub area: f32,
}

/// An event ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub camera_id: CameraId,
    pub recording_id: Option<RecordingId>,
    pub kind: EventKind,
    pub label: String,
    pub confidence: f32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub thumbnail_path: Option<PathBuf>,
    pub payload: DetectionPayload,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    /// Build an event for one detected object (or one motion reading).
    pub fn new(
        camera_id: CameraId,
        kind: EventKind,
        payload: DetectionPayload,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if end_time < start_time {
            return Err(ValidationError::NegativeInterval {
                start: start_time,
                end: end_time,
            });
        }
        if !(0.0..=1.0).contains(&payload.confidence) {
            return Err(ValidationError::Confidence(payload.confidence));
        }
        Ok(Self {
            camera_id,
            recording_id: None,
            kind,
            label: payload.label.clone(),
            confidence: payload.confidence,
            start_time,
            end_time,
            thumbnail_path: None,
            payload,
            created_at: end_time,
        })
    }

    pub fn with_recording(mut self, recording_id: Option<RecordingId>) -> Self {
        self.recording_id = recording_id;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            camera_id: self.camera_id,
            recording_id: self.recording_id,
            kind: self.kind,
            label: self.label,
            confidence: self.confidence,
            start_time: self.start_time,
            end_time: self.end_time,
            thumbnail_path: self.thumbnail_path,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub camera_id: CameraId,
    pub recording_id: Option<RecordingId>,
    pub kind: EventKind,
    pub label: String,
    pub confidence: f32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub thumbnail_path: Option<PathBuf>,
    pub payload: DetectionPayload,
    pub created_at: DateTime<Utc>,
}
