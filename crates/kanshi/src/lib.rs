//! Kanshi - network video recorder core
//!
//! This crate owns the long-running, per-camera machinery of a recorder:
//!
//! - **Core types** (always available): Frame, CameraId, Camera, Recording, Event, Config
//! - **`capture`**: Frame hub (latest frame + drop-oldest fan-out) and the stream supervisor
//! - **`recording`**: Segmenter that cuts bounded-duration segments and registers them
//! - **`detection`**: Throttled inference, motion scoring and event suppression
//! - **`retention`**: Age and capacity eviction over catalog + filesystem
//! - **`registry`**: Camera id → {supervisor, segmenter, dispatcher} lifecycle
//!
//! Feature flags:
//!
//! - **`sqlite`** (default): SQLite-backed [`catalog::SqliteCatalog`]
//! - **`test-source`**: synthetic capture and no-op detector (no hardware needed)

// Core modules (always compiled)
mod error;
mod frame;
mod model;
mod worker;

pub mod backend;
pub mod catalog;
pub mod config;
pub mod live;

pub use error::{CatalogError, ConfigError, ValidationError};
pub use frame::{CameraId, Frame, Resolution};
pub use model::{
    BoundingBox, Camera, CameraUpdate, CaptureSettings, DetectionPayload, Event, EventId,
    EventKind, NewCamera, NewEvent, NewRecording, Recording, RecordingId,
};

// Capture: frame hub, backoff, supervisor
pub mod capture;

// Storage: segment layout, raw segment writer, usage scanning
pub mod storage;

// Recording: segmenter
pub mod recording;

// Detection: dispatcher, motion, suppression
pub mod detection;

// Retention: age/capacity eviction
pub mod retention;

// Registry: per-camera triads
pub mod registry;

pub use config::Config;
pub use registry::{Backends, CameraRegistry, CameraStatus};
