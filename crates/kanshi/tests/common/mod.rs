//! Hand-written backends shared by the integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use kanshi::backend::{
    CaptureBackend, CaptureHandle, Detection, InferenceBackend, ReadOutcome,
};
use kanshi::catalog::{Catalog, EventFilter, MemoryCatalog, RecordingFilter};
use kanshi::live::{EventSink, LiveMessage};
use kanshi::{
    BoundingBox, Camera, CameraId, CaptureSettings, CatalogError, Event, Frame, NewCamera,
    NewEvent, NewRecording, Recording, RecordingId, Resolution,
};

pub const RES: Resolution = Resolution {
    width: 32,
    height: 24,
};

pub fn settings() -> CaptureSettings {
    CaptureSettings {
        fps: 10,
        resolution: RES,
        codec: "raw".to_string(),
        bitrate: 100,
    }
}

pub fn cam_id(id: &str) -> CameraId {
    CameraId::new(id).unwrap()
}

pub fn camera(id: &str) -> Camera {
    NewCamera::new(id, format!("scripted://{id}"))
        .with_id(cam_id(id))
        .with_settings(settings())
        .into_camera(&settings(), Utc::now())
        .unwrap()
}

pub fn solid_frame(res: Resolution, value: u8) -> Frame {
    Frame::rgb(res, Bytes::from(vec![value; res.rgb_len()])).unwrap()
}

/// Wait (in tokio time) until `check` holds, polling every 10ms
pub async fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ========== Capture ==========

/// Capture backend that fails the first `fail_opens` opens, then produces
/// frames every `interval`. Animated frames change brightness every frame.
pub struct ScriptedCapture {
    fail_opens: AtomicU32,
    pub interval: Duration,
    pub animate: bool,
    /// End the stream after this many frames per session
    pub session_frames: Option<u64>,
    opens: Mutex<Vec<Instant>>,
}

impl ScriptedCapture {
    pub fn new(interval: Duration) -> Self {
        Self {
            fail_opens: AtomicU32::new(0),
            interval,
            animate: false,
            session_frames: None,
            opens: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, opens: u32) -> Self {
        self.fail_opens = AtomicU32::new(opens);
        self
    }

    pub fn animated(mut self) -> Self {
        self.animate = true;
        self
    }

    /// Times at which `open` was called
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CaptureBackend for ScriptedCapture {
    async fn open(
        &self,
        _source_uri: &str,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        self.opens.lock().unwrap().push(Instant::now());
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            bail!("connection refused");
        }
        Ok(Box::new(ScriptedHandle {
            resolution: settings.resolution,
            interval: self.interval,
            animate: self.animate,
            limit: self.session_frames,
            produced: 0,
        }))
    }
}

struct ScriptedHandle {
    resolution: Resolution,
    interval: Duration,
    animate: bool,
    limit: Option<u64>,
    produced: u64,
}

#[async_trait::async_trait]
impl CaptureHandle for ScriptedHandle {
    async fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(ReadOutcome::EndOfStream);
        }
        tokio::time::sleep(self.interval).await;
        self.produced += 1;
        let value = if self.animate {
            ((self.produced * 97) % 256) as u8
        } else {
            64
        };
        Ok(ReadOutcome::Frame(solid_frame(self.resolution, value)))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Capture backend whose sessions never deliver a frame and never close
pub struct HangingCapture;

#[async_trait::async_trait]
impl CaptureBackend for HangingCapture {
    async fn open(
        &self,
        _source_uri: &str,
        _settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        Ok(Box::new(HangingHandle))
    }
}

struct HangingHandle;

#[async_trait::async_trait]
impl CaptureHandle for HangingHandle {
    async fn read_frame(&mut self) -> Result<ReadOutcome> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<()> {
        std::future::pending().await
    }
}

/// Routes opens to a hanging backend for one source URI
pub struct RoutedCapture {
    pub hung_uri: String,
    pub normal: ScriptedCapture,
}

#[async_trait::async_trait]
impl CaptureBackend for RoutedCapture {
    async fn open(
        &self,
        source_uri: &str,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        if source_uri == self.hung_uri {
            HangingCapture.open(source_uri, settings).await
        } else {
            self.normal.open(source_uri, settings).await
        }
    }
}

// ========== Inference ==========

/// Returns the same detections for every frame
pub struct StaticInference {
    detections: Mutex<Vec<Detection>>,
    calls: AtomicU64,
}

impl StaticInference {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections: Mutex::new(detections),
            calls: AtomicU64::new(0),
        }
    }

    /// Stop detecting anything from now on
    pub fn clear(&self) {
        self.detections.lock().unwrap().clear();
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn detection(label: &str, confidence: f32) -> Detection {
    Detection {
        label: label.to_string(),
        confidence,
        bbox: BoundingBox::new(1.0, 1.0, 11.0, 6.0),
    }
}

#[async_trait::async_trait]
impl InferenceBackend for StaticInference {
    fn model_name(&self) -> &str {
        "static"
    }

    async fn detect(
        &self,
        _frame: &Frame,
        _confidence: f32,
        _allowed_labels: &[String],
    ) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Deliberately unfiltered: the dispatcher must filter again
        Ok(self.detections.lock().unwrap().clone())
    }
}

// ========== Live sink ==========

#[derive(Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<LiveMessage>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<Event> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                LiveMessage::Event(e) => Some(e.clone()),
                LiveMessage::Status(_) => None,
            })
            .collect()
    }

    pub fn status_count(&self) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, LiveMessage::Status(_)))
            .count()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, message: LiveMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

// ========== Catalog ==========

/// Memory catalog whose first `fail_recording_inserts` recording inserts fail
pub struct FlakyCatalog {
    pub inner: MemoryCatalog,
    fail_recording_inserts: AtomicU32,
    recording_attempts: AtomicU32,
}

impl FlakyCatalog {
    pub fn new(fail_recording_inserts: u32) -> Self {
        Self {
            inner: MemoryCatalog::new(),
            fail_recording_inserts: AtomicU32::new(fail_recording_inserts),
            recording_attempts: AtomicU32::new(0),
        }
    }

    pub fn recording_attempts(&self) -> u32 {
        self.recording_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Catalog for FlakyCatalog {
    async fn insert_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        self.inner.insert_camera(camera).await
    }

    async fn get_camera(&self, id: &CameraId) -> Result<Camera, CatalogError> {
        self.inner.get_camera(id).await
    }

    async fn list_cameras(&self) -> Result<Vec<Camera>, CatalogError> {
        self.inner.list_cameras().await
    }

    async fn update_camera(&self, camera: &Camera) -> Result<(), CatalogError> {
        self.inner.update_camera(camera).await
    }

    async fn delete_camera(&self, id: &CameraId) -> Result<(), CatalogError> {
        self.inner.delete_camera(id).await
    }

    async fn insert_recording(&self, recording: &NewRecording) -> Result<Recording, CatalogError> {
        self.recording_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_recording_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_recording_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(CatalogError::Backend("database is locked".into()));
        }
        self.inner.insert_recording(recording).await
    }

    async fn get_recording(&self, id: RecordingId) -> Result<Recording, CatalogError> {
        self.inner.get_recording(id).await
    }

    async fn list_recordings(
        &self,
        filter: &RecordingFilter,
    ) -> Result<Vec<Recording>, CatalogError> {
        self.inner.list_recordings(filter).await
    }

    async fn delete_recording(&self, id: RecordingId) -> Result<(), CatalogError> {
        self.inner.delete_recording(id).await
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<Event, CatalogError> {
        self.inner.insert_event(event).await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, CatalogError> {
        self.inner.list_events(filter).await
    }

    async fn delete_unlinked_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        self.inner.delete_unlinked_events_before(cutoff).await
    }

    async fn delete_events_for_camera(&self, id: &CameraId) -> Result<u64, CatalogError> {
        self.inner.delete_events_for_camera(id).await
    }
}

// ========== Files ==========

/// Write `len` bytes at `root/name` and return the path
pub fn write_file(root: &Path, name: &str, len: usize) -> PathBuf {
    let path = root.join(name);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(&path, vec![0u8; len]).unwrap();
    path
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
