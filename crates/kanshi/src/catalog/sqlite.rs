//! SQLite catalog
//!
//! One connection behind a mutex; every call runs on the blocking pool so a
//! slow disk never stalls the async workers. Timestamps are stored as
//! microseconds since the Unix epoch, JSON is used for settings and payloads.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{Catalog, EventFilter, Order, RecordingFilter};
use crate::error::CatalogError;
use crate::frame::CameraId;
use crate::model::{
    Camera, CaptureSettings, DetectionPayload, Event, EventId, EventKind, NewEvent, NewRecording,
    Recording, RecordingId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cameras (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_uri TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    settings TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_size_bytes INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    event_based INTEGER NOT NULL,
    motion_score REAL,
    created_at INTEGER NOT NULL,
    CHECK (end_time > start_time)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_id TEXT NOT NULL,
    recording_id INTEGER REFERENCES recordings(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    thumbnail_path TEXT,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recordings_camera_created
    ON recordings(camera_id, created_at);
CREATE INDEX IF NOT EXISTS idx_recordings_created
    ON recordings(created_at);
CREATE INDEX IF NOT EXISTS idx_events_camera_created
    ON events(camera_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_recording
    ON events(recording_id);
"#;

const RECORDING_COLUMNS: &str = "id, camera_id, start_time, end_time, file_path, file_size_bytes, \
     duration_secs, event_based, motion_score, created_at";

const EVENT_COLUMNS: &str = "id, camera_id, recording_id, kind, label, confidence, start_time, \
     end_time, thumbnail_path, payload, created_at";

/// Persistent catalog in a single SQLite file
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteCatalog {
    /// Open (or create) the catalog file, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CatalogError::Backend(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let catalog = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Catalog opened");
        Ok(catalog)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, CatalogError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CatalogError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CatalogError::Backend("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CatalogError::Backend(format!("catalog task failed: {e}")))?
    }
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(v: i64) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::from_timestamp_micros(v)
        .ok_or_else(|| CatalogError::Backend(format!("timestamp {v} out of range")))
}

fn camera_id(raw: String) -> Result<CameraId, CatalogError> {
    Ok(CameraId::new(raw)?)
}

fn not_found(entity: &'static str, id: impl ToString) -> CatalogError {
    CatalogError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn camera_exists(conn: &Connection, id: &str) -> Result<bool, CatalogError> {
    Ok(conn
        .query_row("SELECT 1 FROM cameras WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

struct CameraRow {
    id: String,
    name: String,
    source_uri: String,
    enabled: bool,
    settings: String,
    created_at: i64,
    updated_at: i64,
}

impl CameraRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source_uri: row.get(2)?,
            enabled: row.get(3)?,
            settings: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_camera(self) -> Result<Camera, CatalogError> {
        let settings: CaptureSettings = serde_json::from_str(&self.settings)?;
        Ok(Camera {
            id: camera_id(self.id)?,
            name: self.name,
            source_uri: self.source_uri,
            enabled: self.enabled,
            settings,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

struct RecordingRow {
    id: i64,
    camera_id: String,
    start_time: i64,
    end_time: i64,
    file_path: String,
    file_size_bytes: i64,
    duration_secs: f64,
    event_based: bool,
    motion_score: Option<f64>,
    created_at: i64,
}

impl RecordingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            camera_id: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            file_path: row.get(4)?,
            file_size_bytes: row.get(5)?,
            duration_secs: row.get(6)?,
            event_based: row.get(7)?,
            motion_score: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_recording(self) -> Result<Recording, CatalogError> {
        Ok(Recording {
            id: RecordingId(self.id),
            camera_id: camera_id(self.camera_id)?,
            start_time: from_micros(self.start_time)?,
            end_time: from_micros(self.end_time)?,
            file_path: PathBuf::from(self.file_path),
            file_size_bytes: self.file_size_bytes.max(0) as u64,
            duration_secs: self.duration_secs,
            event_based: self.event_based,
            motion_score: self.motion_score.map(|s| s as f32),
            created_at: from_micros(self.created_at)?,
        })
    }
}

struct EventRow {
    id: i64,
    camera_id: String,
    recording_id: Option<i64>,
    kind: String,
    label: String,
    confidence: f64,
    start_time: i64,
    end_time: i64,
    thumbnail_path: Option<String>,
    payload: String,
    created_at: i64,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            camera_id: row.get(1)?,
            recording_id: row.get(2)?,
            kind: row.get(3)?,
            label: row.get(4)?,
            confidence: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            thumbnail_path: row.get(8)?,
            payload: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_event(self) -> Result<Event, CatalogError> {
        let kind = EventKind::parse(&self.kind)
            .ok_or_else(|| CatalogError::Backend(format!("unknown event kind {:?}", self.kind)))?;
        let payload: DetectionPayload = serde_json::from_str(&self.payload)?;
        Ok(Event {
            id: EventId(self.id),
            camera_id: camera_id(self.camera_id)?,
            recording_id: self.recording_id.map(RecordingId),
            kind,
            label: self.label,
            confidence: self.confidence as f32,
            start_time: from_micros(self.start_time)?,
            end_time: from_micros(self.end_time)?,
            thumbnail_path: self.thumbnail_path.map(PathBuf::from),
            payload,
            created_at: from_micros(self.created_at)?,
        })
    }
}

fn order_sql(order: Order) -> &'static str {
    match order {
        Order::Ascending => "ORDER BY created_at ASC, id ASC",
        Order::Descending => "ORDER BY created_at DESC, id DESC",
    }
}

/// `WHERE` clause plus bound values
fn where_clause(conditions: Vec<(&str, Value)>) -> (String, Vec<Value>) {
    if conditions.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut sql = String::from("WHERE ");
    let mut values = Vec::with_capacity(conditions.len());
    for (i, (cond, value)) in conditions.into_iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        sql.push_str(cond);
        values.push(value);
    }
    (sql, values)
}

#[async_trait::async_trait]
impl Catalog for SqliteCatalog {
    async fn insert_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        let camera = camera.clone();
        let settings = serde_json::to_string(&camera.settings)?;
        self.with_conn(move |conn| {
            if camera_exists(conn, camera.id.as_str())? {
                return Err(CatalogError::Duplicate {
                    entity: "camera",
                    id: camera.id.to_string(),
                });
            }
            conn.execute(
                "INSERT INTO cameras (id, name, source_uri, enabled, settings, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    camera.id.as_str(),
                    camera.name,
                    camera.source_uri,
                    camera.enabled,
                    settings,
                    to_micros(camera.created_at),
                    to_micros(camera.updated_at),
                ],
            )?;
            debug!(camera = %camera.id, "Camera row inserted");
            Ok(())
        })
        .await
    }

    async fn get_camera(&self, id: &CameraId) -> Result<Camera, CatalogError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, source_uri, enabled, settings, created_at, updated_at
                 FROM cameras WHERE id = ?1",
                [id.as_str()],
                CameraRow::from_row,
            )
            .optional()?
            .ok_or_else(|| not_found("camera", &id))?
            .into_camera()
        })
        .await
    }

    async fn list_cameras(&self) -> Result<Vec<Camera>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, source_uri, enabled, settings, created_at, updated_at
                 FROM cameras ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([], CameraRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(CameraRow::into_camera).collect()
        })
        .await
    }

    async fn update_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        let camera = camera.clone();
        let settings = serde_json::to_string(&camera.settings)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE cameras SET name = ?2, source_uri = ?3, enabled = ?4, settings = ?5,
                 updated_at = ?6 WHERE id = ?1",
                params![
                    camera.id.as_str(),
                    camera.name,
                    camera.source_uri,
                    camera.enabled,
                    settings,
                    to_micros(camera.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(not_found("camera", &camera.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_camera(&self, id: &CameraId) -> Result<(), CatalogError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM cameras WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(not_found("camera", &id));
            }
            Ok(())
        })
        .await
    }

    async fn insert_recording(&self, recording: &NewRecording) -> Result<Recording, CatalogError> {
        let recording = recording.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !camera_exists(&tx, recording.camera_id().as_str())? {
                return Err(CatalogError::UnknownCamera(recording.camera_id().clone()));
            }
            tx.execute(
                "INSERT INTO recordings (camera_id, start_time, end_time, file_path,
                 file_size_bytes, duration_secs, event_based, motion_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    recording.camera_id().as_str(),
                    to_micros(recording.start_time()),
                    to_micros(recording.end_time()),
                    recording.file_path().to_string_lossy(),
                    recording.file_size_bytes() as i64,
                    recording.duration().as_secs_f64(),
                    recording.event_based(),
                    recording.motion_score().map(f64::from),
                    to_micros(recording.created_at()),
                ],
            )?;
            let id = RecordingId(tx.last_insert_rowid());
            // Events written while the segment was still open
            let linked = tx.execute(
                "UPDATE events SET recording_id = ?1
                 WHERE camera_id = ?2 AND recording_id IS NULL
                   AND start_time <= ?4 AND end_time >= ?3",
                params![
                    id.0,
                    recording.camera_id().as_str(),
                    to_micros(recording.start_time()),
                    to_micros(recording.end_time()),
                ],
            )?;
            tx.commit()?;
            if linked > 0 {
                debug!(recording = %id, events = linked, "Linked events to recording");
            }
            Ok(recording.into_recording(id))
        })
        .await
    }

    async fn get_recording(&self, id: RecordingId) -> Result<Recording, CatalogError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {RECORDING_COLUMNS} FROM recordings WHERE id = ?1"),
                [id.0],
                RecordingRow::from_row,
            )
            .optional()?
            .ok_or_else(|| not_found("recording", id))?
            .into_recording()
        })
        .await
    }

    async fn list_recordings(
        &self,
        filter: &RecordingFilter,
    ) -> Result<Vec<Recording>, CatalogError> {
        let mut conditions = Vec::new();
        if let Some(camera) = &filter.camera_id {
            conditions.push(("camera_id = ?", Value::Text(camera.to_string())));
        }
        if let Some(cutoff) = filter.created_before {
            conditions.push(("created_at < ?", Value::Integer(to_micros(cutoff))));
        }
        let (where_sql, mut values) = where_clause(conditions);
        values.push(Value::Integer(filter.limit_or_default() as i64));
        values.push(Value::Integer(filter.offset as i64));
        let sql = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings {where_sql} {} LIMIT ? OFFSET ?",
            order_sql(filter.order)
        );

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), RecordingRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RecordingRow::into_recording).collect()
        })
        .await
    }

    async fn delete_recording(&self, id: RecordingId) -> Result<(), CatalogError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM events WHERE recording_id = ?1", [id.0])?;
            let changed = tx.execute("DELETE FROM recordings WHERE id = ?1", [id.0])?;
            if changed == 0 {
                return Err(not_found("recording", id));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<Event, CatalogError> {
        let mut event = event.clone();
        let payload = serde_json::to_string(&event.payload)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !camera_exists(&tx, event.camera_id.as_str())? {
                return Err(CatalogError::UnknownCamera(event.camera_id.clone()));
            }
            if let Some(rec_id) = event.recording_id {
                let recording = tx
                    .query_row(
                        &format!("SELECT {RECORDING_COLUMNS} FROM recordings WHERE id = ?1"),
                        [rec_id.0],
                        RecordingRow::from_row,
                    )
                    .optional()?
                    .ok_or_else(|| not_found("recording", rec_id))?
                    .into_recording()?;
                if recording.camera_id != event.camera_id
                    || !recording.overlaps(event.start_time, event.end_time)
                {
                    return Err(CatalogError::RecordingMismatch(rec_id));
                }
            } else {
                event.recording_id = tx
                    .query_row(
                        "SELECT id FROM recordings
                         WHERE camera_id = ?1 AND start_time <= ?3 AND end_time >= ?2
                         ORDER BY created_at DESC, id DESC LIMIT 1",
                        params![
                            event.camera_id.as_str(),
                            to_micros(event.start_time),
                            to_micros(event.end_time),
                        ],
                        |row| row.get(0),
                    )
                    .optional()?
                    .map(RecordingId);
            }
            tx.execute(
                "INSERT INTO events (camera_id, recording_id, kind, label, confidence,
                 start_time, end_time, thumbnail_path, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.camera_id.as_str(),
                    event.recording_id.map(|r| r.0),
                    event.kind.as_str(),
                    event.label,
                    f64::from(event.confidence),
                    to_micros(event.start_time),
                    to_micros(event.end_time),
                    event
                        .thumbnail_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    payload,
                    to_micros(event.created_at),
                ],
            )?;
            let id = EventId(tx.last_insert_rowid());
            tx.commit()?;
            Ok(event.into_event(id))
        })
        .await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, CatalogError> {
        let mut conditions = Vec::new();
        if let Some(camera) = &filter.camera_id {
            conditions.push(("camera_id = ?", Value::Text(camera.to_string())));
        }
        if let Some(kind) = filter.kind {
            conditions.push(("kind = ?", Value::Text(kind.as_str().to_string())));
        }
        if let Some(label) = &filter.label {
            conditions.push(("label = ?", Value::Text(label.clone())));
        }
        if let Some(rec) = filter.recording_id {
            conditions.push(("recording_id = ?", Value::Integer(rec.0)));
        }
        let (where_sql, mut values) = where_clause(conditions);
        values.push(Value::Integer(filter.limit_or_default() as i64));
        values.push(Value::Integer(filter.offset as i64));
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events {where_sql} {} LIMIT ? OFFSET ?",
            order_sql(filter.order)
        );

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), EventRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(EventRow::into_event).collect()
        })
        .await
    }

    async fn delete_unlinked_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM events WHERE recording_id IS NULL AND created_at < ?1",
                [to_micros(cutoff)],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn delete_events_for_camera(&self, id: &CameraId) -> Result<u64, CatalogError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM events WHERE camera_id = ?1", [id.as_str()])?;
            Ok(n as u64)
        })
        .await
    }

    async fn close(&self) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
        .await?;
        debug!("Catalog closed");
        Ok(())
    }
}
