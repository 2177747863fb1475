//! In-process catalog
//!
//! Same semantics as the SQLite catalog (foreign keys, overlap check, cascade)
//! over plain maps behind a `RwLock`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Catalog, EventFilter, Order, RecordingFilter};
use crate::error::CatalogError;
use crate::frame::CameraId;
use crate::model::{Camera, Event, EventId, NewEvent, NewRecording, Recording, RecordingId};

#[derive(Default)]
struct Tables {
    cameras: HashMap<CameraId, Camera>,
    recordings: BTreeMap<RecordingId, Recording>,
    events: BTreeMap<EventId, Event>,
    next_recording: i64,
    next_event: i64,
}

/// Catalog held entirely in memory
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_and_page<T>(
    mut rows: Vec<T>,
    key: impl Fn(&T) -> (DateTime<Utc>, i64),
    order: Order,
    offset: usize,
    limit: usize,
) -> Vec<T> {
    rows.sort_by_key(key);
    if order == Order::Descending {
        rows.reverse();
    }
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn insert_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        let mut t = self.tables.write().await;
        if t.cameras.contains_key(&camera.id) {
            return Err(CatalogError::Duplicate {
                entity: "camera",
                id: camera.id.to_string(),
            });
        }
        t.cameras.insert(camera.id.clone(), camera.clone());
        Ok(())
    }

    async fn get_camera(&self, id: &CameraId) -> Result<Camera, CatalogError> {
        self.tables
            .read()
            .await
            .cameras
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                entity: "camera",
                id: id.to_string(),
            })
    }

    async fn list_cameras(&self) -> Result<Vec<Camera>, CatalogError> {
        let t = self.tables.read().await;
        let mut cameras: Vec<Camera> = t.cameras.values().cloned().collect();
        cameras.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(cameras)
    }

    async fn update_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        let mut t = self.tables.write().await;
        match t.cameras.get_mut(&camera.id) {
            Some(existing) => {
                *existing = camera.clone();
                Ok(())
            }
            None => Err(CatalogError::NotFound {
                entity: "camera",
                id: camera.id.to_string(),
            }),
        }
    }

    async fn delete_camera(&self, id: &CameraId) -> Result<(), CatalogError> {
        let mut t = self.tables.write().await;
        t.cameras
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::NotFound {
                entity: "camera",
                id: id.to_string(),
            })
    }

    async fn insert_recording(&self, recording: &NewRecording) -> Result<Recording, CatalogError> {
        let mut t = self.tables.write().await;
        if !t.cameras.contains_key(recording.camera_id()) {
            return Err(CatalogError::UnknownCamera(recording.camera_id().clone()));
        }
        t.next_recording += 1;
        let id = RecordingId(t.next_recording);
        let row = recording.clone().into_recording(id);
        t.recordings.insert(id, row.clone());
        for event in t.events.values_mut() {
            if event.camera_id == row.camera_id
                && event.recording_id.is_none()
                && row.overlaps(event.start_time, event.end_time)
            {
                event.recording_id = Some(id);
            }
        }
        Ok(row)
    }

    async fn get_recording(&self, id: RecordingId) -> Result<Recording, CatalogError> {
        self.tables
            .read()
            .await
            .recordings
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                entity: "recording",
                id: id.to_string(),
            })
    }

    async fn list_recordings(
        &self,
        filter: &RecordingFilter,
    ) -> Result<Vec<Recording>, CatalogError> {
        let t = self.tables.read().await;
        let rows = t
            .recordings
            .values()
            .filter(|r| filter.camera_id.as_ref().map_or(true, |c| &r.camera_id == c))
            .filter(|r| filter.created_before.map_or(true, |cut| r.created_at < cut))
            .cloned()
            .collect();
        Ok(sort_and_page(
            rows,
            |r: &Recording| (r.created_at, r.id.0),
            filter.order,
            filter.offset,
            filter.limit_or_default(),
        ))
    }

    async fn delete_recording(&self, id: RecordingId) -> Result<(), CatalogError> {
        let mut t = self.tables.write().await;
        if t.recordings.remove(&id).is_none() {
            return Err(CatalogError::NotFound {
                entity: "recording",
                id: id.to_string(),
            });
        }
        t.events.retain(|_, e| e.recording_id != Some(id));
        Ok(())
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<Event, CatalogError> {
        let mut t = self.tables.write().await;
        if !t.cameras.contains_key(&event.camera_id) {
            return Err(CatalogError::UnknownCamera(event.camera_id.clone()));
        }
        if let Some(rec_id) = event.recording_id {
            let recording = t.recordings.get(&rec_id).ok_or_else(|| CatalogError::NotFound {
                entity: "recording",
                id: rec_id.to_string(),
            })?;
            if recording.camera_id != event.camera_id
                || !recording.overlaps(event.start_time, event.end_time)
            {
                return Err(CatalogError::RecordingMismatch(rec_id));
            }
        }
        let mut event = event.clone();
        if event.recording_id.is_none() {
            event.recording_id = t
                .recordings
                .values()
                .filter(|r| r.camera_id == event.camera_id)
                .filter(|r| r.overlaps(event.start_time, event.end_time))
                .max_by_key(|r| (r.created_at, r.id))
                .map(|r| r.id);
        }
        t.next_event += 1;
        let id = EventId(t.next_event);
        let row = event.into_event(id);
        t.events.insert(id, row.clone());
        Ok(row)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, CatalogError> {
        let t = self.tables.read().await;
        let rows = t
            .events
            .values()
            .filter(|e| filter.camera_id.as_ref().map_or(true, |c| &e.camera_id == c))
            .filter(|e| filter.kind.map_or(true, |k| e.kind == k))
            .filter(|e| filter.label.as_ref().map_or(true, |l| &e.label == l))
            .filter(|e| filter.recording_id.map_or(true, |r| e.recording_id == Some(r)))
            .cloned()
            .collect();
        Ok(sort_and_page(
            rows,
            |e: &Event| (e.created_at, e.id.0),
            filter.order,
            filter.offset,
            filter.limit_or_default(),
        ))
    }

    async fn delete_unlinked_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        let mut t = self.tables.write().await;
        let before = t.events.len();
        t.events
            .retain(|_, e| e.recording_id.is_some() || e.created_at >= cutoff);
        Ok((before - t.events.len()) as u64)
    }

    async fn delete_events_for_camera(&self, id: &CameraId) -> Result<u64, CatalogError> {
        let mut t = self.tables.write().await;
        let before = t.events.len();
        t.events.retain(|_, e| &e.camera_id != id);
        Ok((before - t.events.len()) as u64)
    }
}
