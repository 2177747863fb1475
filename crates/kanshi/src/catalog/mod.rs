//! Catalog of cameras, recordings and events
//!
//! The catalog is a transactional CRUD store passed explicitly as
//! `Arc<dyn Catalog>`. Each call is a small independent transaction, so
//! workers for different cameras never coordinate beyond it.
//!
//! Backends:
//! - [`MemoryCatalog`]: in-process maps, used by tests and ephemeral setups
//! - [`SqliteCatalog`] (feature `sqlite`): single-file persistent store

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::CatalogError;
use crate::frame::CameraId;
use crate::model::{Camera, Event, EventKind, NewEvent, NewRecording, Recording, RecordingId};

pub use memory::MemoryCatalog;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCatalog;

/// Default page size for list queries
pub const DEFAULT_LIMIT: usize = 100;

/// Sort direction on `created_at` (ties broken by id)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Recording query
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    pub camera_id: Option<CameraId>,
    /// Only rows with `created_at` strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    pub order: Order,
    /// Rows to skip after filtering and ordering
    pub offset: usize,
    /// Maximum rows; `None` means [`DEFAULT_LIMIT`]
    pub limit: Option<usize>,
}

impl RecordingFilter {
    pub fn for_camera(camera_id: CameraId) -> Self {
        Self {
            camera_id: Some(camera_id),
            ..Default::default()
        }
    }

    pub fn limit_or_default(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Event query
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub camera_id: Option<CameraId>,
    pub kind: Option<EventKind>,
    pub label: Option<String>,
    pub recording_id: Option<RecordingId>,
    pub order: Order,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn limit_or_default(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Typed CRUD over the three tables.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    // ========== Cameras ==========

    async fn insert_camera(&self, camera: &Camera) -> Result<(), CatalogError>;

    async fn get_camera(&self, id: &CameraId) -> Result<Camera, CatalogError>;

    async fn list_cameras(&self) -> Result<Vec<Camera>, CatalogError>;

    async fn update_camera(&self, camera: &Camera) -> Result<(), CatalogError>;

    /// Delete the camera row only; its history is removed separately.
    async fn delete_camera(&self, id: &CameraId) -> Result<(), CatalogError>;

    // ========== Recordings ==========

    /// Insert a closed segment. Fails with `UnknownCamera` if the camera row
    /// does not exist.
    ///
    /// In the same transaction, the camera's unlinked events overlapping the
    /// segment are linked to it: they were written while it was still open.
    async fn insert_recording(&self, recording: &NewRecording) -> Result<Recording, CatalogError>;

    async fn get_recording(&self, id: RecordingId) -> Result<Recording, CatalogError>;

    async fn list_recordings(
        &self,
        filter: &RecordingFilter,
    ) -> Result<Vec<Recording>, CatalogError>;

    /// Delete a recording row and, in the same transaction, its events.
    async fn delete_recording(&self, id: RecordingId) -> Result<(), CatalogError>;

    // ========== Events ==========

    /// Insert an event. The camera must exist and a referenced recording must
    /// overlap the event interval. An event without a recording is linked to
    /// the newest of the camera's recordings that overlaps it, if any.
    async fn insert_event(&self, event: &NewEvent) -> Result<Event, CatalogError>;

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, CatalogError>;

    /// Delete events not linked to a recording and created before `cutoff`.
    async fn delete_unlinked_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CatalogError>;

    /// Delete every event of a camera.
    async fn delete_events_for_camera(&self, id: &CameraId) -> Result<u64, CatalogError>;

    /// Flush and release the store. Further calls may fail.
    async fn close(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}
