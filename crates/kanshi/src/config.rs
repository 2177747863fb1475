//! Recorder configuration
//!
//! Loaded from a YAML file; every section and field is optional and falls back
//! to its default. Unknown keys are rejected so typos fail loudly at startup.
//!
//! ```yaml
//! storage:
//!   path: /var/lib/kanshi/recordings
//!   max_size_gb: 500
//!   retention_days: 30
//! cameras:
//!   default_settings:
//!     fps: 15
//!     resolution: [1920, 1080]
//! detection:
//!   enabled: true
//!   classes: [person, car]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::backoff::Backoff;
use crate::capture::supervisor::SupervisorConfig;
use crate::detection::dispatcher::DispatcherConfig;
use crate::detection::motion::MotionSettings;
use crate::error::ConfigError;
use crate::model::CaptureSettings;
use crate::recording::segmenter::SegmenterConfig;
use crate::retention::RetentionConfig;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cameras: CamerasConfig,
    pub recording: RecordingConfig,
    pub detection: DetectionConfig,
    pub motion: MotionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the live event/status broadcast
    pub buffer_capacity: usize,
    /// How often a status snapshot is pushed to live consumers
    pub status_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            buffer_capacity: 256,
            status_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory for segment files
    pub path: PathBuf,
    /// Capacity limit for everything under `path`
    pub max_size_gb: f64,
    /// Recordings older than this are evicted (0 disables age eviction)
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
    /// SQLite catalog file
    pub catalog_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./recordings"),
            max_size_gb: 100.0,
            retention_days: 30,
            cleanup_interval_secs: 3600,
            catalog_path: PathBuf::from("./data/kanshi.db"),
        }
    }
}

impl StorageConfig {
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_gb * BYTES_PER_GB) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CamerasConfig {
    /// Capture settings for cameras added without explicit settings
    pub default_settings: CaptureSettings,
    /// Per-subscriber frame queue depth
    pub queue_capacity: usize,
    pub open_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-worker stop grace period, also used by the retention engine
    pub stop_grace_secs: u64,
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            default_settings: CaptureSettings::default(),
            queue_capacity: 30,
            open_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            stop_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub max_segment_secs: u64,
    /// Record whenever the stream is running
    pub continuous: bool,
    pub insert_retry_attempts: u32,
    pub insert_retry_initial_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_segment_secs: 3600,
            continuous: true,
            insert_retry_attempts: 5,
            insert_retry_initial_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub model: String,
    /// Labels to keep; empty keeps everything
    pub classes: Vec<String>,
    pub confidence: f32,
    pub sample_hz: f64,
    pub suppression_secs: u64,
    /// Open event-based segments on detections when nothing is recording
    pub event_recording: bool,
    pub quiet_period_secs: u64,
    pub inference_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "yolov8n".to_string(),
            classes: vec![
                "person".to_string(),
                "car".to_string(),
                "truck".to_string(),
                "bicycle".to_string(),
                "motorcycle".to_string(),
                "dog".to_string(),
                "cat".to_string(),
            ],
            confidence: 0.5,
            sample_hz: 10.0,
            suppression_secs: 5,
            event_recording: false,
            quiet_period_secs: 10,
            inference_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Changed-pixel count below which a difference is treated as noise
    pub min_area: u32,
    /// Fraction of changed pixels that counts as motion
    pub sensitivity: f32,
    /// Per-pixel luma difference that counts as changed
    pub pixel_threshold: u8,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_area: 500,
            sensitivity: 0.02,
            pixel_threshold: 25,
        }
    }
}

impl Config {
    /// Read and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cameras
            .default_settings
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("cameras.default_settings: {e}")))?;

        if !(self.storage.max_size_gb > 0.0) {
            return Err(ConfigError::Invalid(
                "storage.max_size_gb must be positive".into(),
            ));
        }
        if self.storage.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage.cleanup_interval_secs must be positive".into(),
            ));
        }
        if self.cameras.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cameras.queue_capacity must be positive".into(),
            ));
        }
        if self.cameras.backoff_initial_ms == 0
            || self.cameras.backoff_max_ms < self.cameras.backoff_initial_ms
        {
            return Err(ConfigError::Invalid(
                "cameras.backoff_initial_ms must be positive and not above backoff_max_ms".into(),
            ));
        }
        if self.recording.max_segment_secs == 0 {
            return Err(ConfigError::Invalid(
                "recording.max_segment_secs must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection.confidence {} is outside [0, 1]",
                self.detection.confidence
            )));
        }
        if !(self.detection.sample_hz > 0.0 && self.detection.sample_hz <= 1000.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.sample_hz {} must be in (0, 1000]",
                self.detection.sample_hz
            )));
        }
        if !(0.0..=1.0).contains(&self.motion.sensitivity) {
            return Err(ConfigError::Invalid(format!(
                "motion.sensitivity {} is outside [0, 1]",
                self.motion.sensitivity
            )));
        }
        Ok(())
    }

    /// Stop grace period applied to each worker
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.cameras.stop_grace_secs)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            queue_capacity: self.cameras.queue_capacity,
            open_timeout: Duration::from_millis(self.cameras.open_timeout_ms),
            backoff: Backoff::new(
                Duration::from_millis(self.cameras.backoff_initial_ms),
                Duration::from_millis(self.cameras.backoff_max_ms),
            ),
            stop_grace: self.stop_grace(),
        }
    }

    pub fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            storage_root: self.storage.path.clone(),
            max_segment: Duration::from_secs(self.recording.max_segment_secs),
            continuous: self.recording.continuous,
            insert_retry: Backoff::new(
                Duration::from_millis(self.recording.insert_retry_initial_ms),
                Duration::from_millis(self.recording.insert_retry_initial_ms.saturating_mul(16)),
            ),
            insert_retry_attempts: self.recording.insert_retry_attempts,
            stop_grace: self.stop_grace(),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            detection_enabled: self.detection.enabled,
            classes: self.detection.classes.clone(),
            confidence: self.detection.confidence,
            sample_interval: Duration::from_secs_f64(1.0 / self.detection.sample_hz),
            suppression_window: Duration::from_secs(self.detection.suppression_secs),
            event_recording: self.detection.event_recording,
            quiet_period: Duration::from_secs(self.detection.quiet_period_secs),
            inference_timeout: Duration::from_millis(self.detection.inference_timeout_ms),
            motion: self.motion.enabled.then(|| MotionSettings {
                pixel_threshold: self.motion.pixel_threshold,
                min_area: self.motion.min_area,
                sensitivity: self.motion.sensitivity,
            }),
            stop_grace: self.stop_grace(),
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            storage_root: self.storage.path.clone(),
            max_size_bytes: self.storage.max_size_bytes(),
            retention: (self.storage.retention_days > 0)
                .then(|| Duration::from_secs(u64::from(self.storage.retention_days) * 86_400)),
            interval: Duration::from_secs(self.storage.cleanup_interval_secs),
            stop_grace: self.stop_grace(),
        }
    }
}
