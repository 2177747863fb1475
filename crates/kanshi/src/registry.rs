//! Camera registry
//!
//! Maps each enabled camera to its triad of workers: a stream supervisor
//! (capture + frame hub), a segmenter and a detection dispatcher. The
//! registry exclusively owns every worker's lifecycle handle.
//!
//! Two locks: `lifecycle` serializes add/remove/update/load/shutdown and may
//! be held while triads start and stop. `triads` guards the map itself and is
//! never held across an await, so status reads and frame grabs never wait
//! behind a camera that is slow to stop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::{CaptureBackend, InferenceBackend, SegmentWriterBackend};
use crate::capture::{StreamStatus, StreamSupervisor};
use crate::catalog::{Catalog, RecordingFilter};
use crate::config::Config;
use crate::detection::{Dispatcher, DispatcherDeps, DispatcherStatus};
use crate::frame::{CameraId, Frame};
use crate::live::{EventSink, LiveMessage};
use crate::model::{Camera, CameraUpdate, NewCamera};
use crate::recording::{Segmenter, SegmenterDeps, SegmenterStatus};
use crate::retention::evict_recording;
use crate::storage;

/// External collaborators shared by every camera
#[derive(Clone)]
pub struct Backends {
    pub capture: Arc<dyn CaptureBackend>,
    pub writer: Arc<dyn SegmentWriterBackend>,
    pub inference: Arc<dyn InferenceBackend>,
}

/// Status of one running camera
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub name: String,
    pub stream: StreamStatus,
    pub recording: SegmenterStatus,
    pub detection: DispatcherStatus,
}

/// The three workers of one camera
struct Triad {
    camera: Camera,
    supervisor: StreamSupervisor,
    segmenter: Segmenter,
    dispatcher: Dispatcher,
}

impl Triad {
    async fn start(
        camera: Camera,
        config: &Config,
        backends: &Backends,
        catalog: &Arc<dyn Catalog>,
        sink: &Arc<dyn EventSink>,
    ) -> Result<Self> {
        let dir = storage::camera_dir(&config.storage.path, &camera.id);
        storage::ensure_dir(&dir)
            .await
            .with_context(|| format!("Camera {} storage unavailable", camera.id))?;

        let mut supervisor =
            StreamSupervisor::new(&camera, backends.capture.clone(), config.supervisor());

        // Consumers subscribe before capture starts so they see the first frame
        let segmenter = Segmenter::start(
            &camera,
            SegmenterDeps {
                hub: supervisor.hub().clone(),
                stream_state: supervisor.watch_state(),
                writer: backends.writer.clone(),
                catalog: catalog.clone(),
            },
            config.segmenter(),
        );
        let dispatcher = Dispatcher::start(
            &camera,
            DispatcherDeps {
                hub: supervisor.hub().clone(),
                inference: backends.inference.clone(),
                catalog: catalog.clone(),
                sink: sink.clone(),
                segmenter: segmenter.handle(),
            },
            config.dispatcher(),
        );
        supervisor.start();

        Ok(Self {
            camera,
            supervisor,
            segmenter,
            dispatcher,
        })
    }

    /// Stop all three workers concurrently, each bounded by its own grace.
    /// Returns `false` if any worker had to be abandoned.
    async fn stop(mut self) -> bool {
        let (dispatcher, segmenter, supervisor) = tokio::join!(
            self.dispatcher.stop(),
            self.segmenter.stop(),
            self.supervisor.stop(),
        );
        let clean = dispatcher && segmenter && supervisor;
        if !clean {
            warn!(camera = %self.camera.id, "Camera workers did not stop cleanly");
        }
        clean
    }

    fn status(&self) -> CameraStatus {
        CameraStatus {
            camera_id: self.camera.id.clone(),
            name: self.camera.name.clone(),
            stream: self.supervisor.status(),
            recording: self.segmenter.status(),
            detection: self.dispatcher.status(),
        }
    }
}

/// Owns the per-camera triads, the catalog client and the backends
pub struct CameraRegistry {
    config: Arc<Config>,
    catalog: Arc<dyn Catalog>,
    backends: Backends,
    sink: Arc<dyn EventSink>,
    lifecycle: Mutex<()>,
    triads: Mutex<HashMap<CameraId, Triad>>,
}

impl CameraRegistry {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn Catalog>,
        backends: Backends,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            catalog,
            backends,
            sink,
            lifecycle: Mutex::new(()),
            triads: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn start_triad(&self, camera: Camera) -> Result<Triad> {
        Triad::start(camera, &self.config, &self.backends, &self.catalog, &self.sink).await
    }

    /// Take a triad out of the map; the caller stops it without the map lock
    async fn take_triad(&self, id: &CameraId) -> Option<Triad> {
        self.triads.lock().await.remove(id)
    }

    async fn put_triad(&self, triad: Triad) {
        self.triads.lock().await.insert(triad.camera.id.clone(), triad);
    }

    /// Start a triad for every enabled camera in the catalog.
    ///
    /// A camera that fails to start is logged and skipped. Returns the number
    /// of triads running afterwards.
    pub async fn load(&self) -> Result<usize> {
        let cameras = self
            .catalog
            .list_cameras()
            .await
            .context("Failed to list cameras")?;

        let _lifecycle = self.lifecycle.lock().await;
        for camera in cameras.into_iter().filter(|c| c.enabled) {
            if self.is_running(&camera.id).await {
                continue;
            }
            let id = camera.id.clone();
            match self.start_triad(camera).await {
                Ok(triad) => {
                    self.put_triad(triad).await;
                }
                Err(e) => error!(camera = %id, error = %format!("{e:#}"), "Failed to start camera"),
            }
        }
        let running = self.triads.lock().await.len();
        info!(running, "Cameras loaded");
        Ok(running)
    }

    /// Persist a new camera and, if enabled, start its triad.
    ///
    /// The camera stays persisted even if its triad fails to start.
    pub async fn add(&self, new: NewCamera) -> Result<Camera> {
        let camera = new.into_camera(&self.config.cameras.default_settings, Utc::now())?;

        let _lifecycle = self.lifecycle.lock().await;
        self.catalog
            .insert_camera(&camera)
            .await
            .with_context(|| format!("Failed to add camera {}", camera.id))?;
        info!(camera = %camera.id, name = %camera.name, enabled = camera.enabled, "Camera added");

        if camera.enabled {
            let triad = self.start_triad(camera.clone()).await?;
            self.put_triad(triad).await;
        }
        Ok(camera)
    }

    /// Stop the camera's triad and delete it, optionally with its
    /// recordings (files and rows) and events.
    pub async fn remove(&self, id: &CameraId, purge_history: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        // Fail before stopping anything if the camera does not exist
        self.catalog.get_camera(id).await?;

        if let Some(triad) = self.take_triad(id).await {
            triad.stop().await;
        }

        if purge_history {
            self.purge_history(id).await?;
        }
        self.catalog.delete_camera(id).await?;
        info!(camera = %id, purge_history, "Camera removed");
        Ok(())
    }

    async fn purge_history(&self, id: &CameraId) -> Result<()> {
        let mut failed = 0usize;
        let mut removed = 0u64;
        loop {
            let page = self
                .catalog
                .list_recordings(&RecordingFilter {
                    offset: failed,
                    ..RecordingFilter::for_camera(id.clone())
                })
                .await?;
            if page.is_empty() {
                break;
            }
            for recording in &page {
                match evict_recording(self.catalog.as_ref(), recording).await {
                    Ok(_) => removed += 1,
                    Err(e) => {
                        warn!(camera = %id, recording = %recording.id, error = %format!("{e:#}"), "Failed to purge recording");
                        failed += 1;
                    }
                }
            }
        }
        let events = self.catalog.delete_events_for_camera(id).await?;
        info!(camera = %id, recordings = removed, events, "Camera history purged");
        if failed > 0 {
            bail!("{failed} recordings of camera {id} could not be deleted");
        }
        Ok(())
    }

    /// Persist changes. Toggling `enabled` starts or stops the triad; a new
    /// source URI or new capture settings restart a running triad.
    pub async fn update(&self, id: &CameraId, update: CameraUpdate) -> Result<Camera> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.catalog.get_camera(id).await?;
        let updated = update.apply(&current, Utc::now())?;
        self.catalog
            .update_camera(&updated)
            .await
            .with_context(|| format!("Failed to update camera {id}"))?;

        let restart = updated.source_uri != current.source_uri || updated.settings != current.settings;

        if !updated.enabled {
            if let Some(triad) = self.take_triad(id).await {
                triad.stop().await;
                info!(camera = %id, "Camera disabled");
            }
            return Ok(updated);
        }

        if !restart {
            if let Some(triad) = self.triads.lock().await.get_mut(id) {
                triad.camera = updated.clone();
                return Ok(updated);
            }
        }

        match self.take_triad(id).await {
            Some(triad) => {
                info!(camera = %id, "Camera source changed, restarting");
                triad.stop().await;
            }
            None => info!(camera = %id, "Camera enabled"),
        }

        let triad = self.start_triad(updated.clone()).await?;
        self.put_triad(triad).await;
        Ok(updated)
    }

    /// Stop every triad concurrently. Each is bounded by its grace period;
    /// stragglers are logged and abandoned. Closes the catalog afterwards.
    ///
    /// Returns the number of cameras that did not stop cleanly.
    pub async fn shutdown(&self) -> usize {
        let _lifecycle = self.lifecycle.lock().await;
        let triads: Vec<Triad> = {
            let mut map = self.triads.lock().await;
            map.drain().map(|(_, t)| t).collect()
        };
        let total = triads.len();
        info!(cameras = total, "Stopping all cameras");

        let results = join_all(triads.into_iter().map(|t| async move {
            let id = t.camera.id.clone();
            (id, t.stop().await)
        }))
        .await;

        let abandoned: Vec<CameraId> = results
            .into_iter()
            .filter_map(|(id, clean)| (!clean).then_some(id))
            .collect();
        for id in &abandoned {
            warn!(camera = %id, "Camera abandoned during shutdown");
        }

        if let Err(e) = self.catalog.close().await {
            warn!(error = %e, "Failed to close catalog");
        }
        info!(cameras = total, abandoned = abandoned.len(), "Registry shut down");
        abandoned.len()
    }

    /// Most recent frame of a running camera, without waiting
    pub async fn latest_frame(&self, id: &CameraId) -> Option<Frame> {
        self.triads.lock().await.get(id).and_then(|t| t.supervisor.hub().latest())
    }

    pub async fn status(&self, id: &CameraId) -> Option<CameraStatus> {
        self.triads.lock().await.get(id).map(Triad::status)
    }

    /// Status of every running camera, ordered by id
    pub async fn statuses(&self) -> Vec<CameraStatus> {
        let mut list: Vec<CameraStatus> = self.triads.lock().await.values().map(Triad::status).collect();
        list.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        list
    }

    pub async fn camera(&self, id: &CameraId) -> Result<Camera> {
        Ok(self.catalog.get_camera(id).await?)
    }

    pub async fn cameras(&self) -> Result<Vec<Camera>> {
        Ok(self.catalog.list_cameras().await?)
    }

    pub async fn is_running(&self, id: &CameraId) -> bool {
        self.triads.lock().await.contains_key(id)
    }

    /// Start continuous recording on a running camera. Returns `false` if it
    /// was already recording continuously.
    pub async fn start_recording(&self, id: &CameraId) -> Result<bool> {
        let handle = match self.triads.lock().await.get(id) {
            Some(t) => t.segmenter.handle(),
            None => bail!("camera {id} is not running"),
        };
        Ok(handle.start_recording(false).await)
    }

    /// Stop recording on a running camera and register the open segment.
    pub async fn stop_recording(&self, id: &CameraId) -> Result<bool> {
        let handle = match self.triads.lock().await.get(id) {
            Some(t) => t.segmenter.handle(),
            None => bail!("camera {id} is not running"),
        };
        Ok(handle.stop_recording().await)
    }

    /// Push a status snapshot of every running camera to the live sink
    pub async fn publish_status(&self) {
        let statuses = self.statuses().await;
        self.sink.publish(LiveMessage::Status(statuses));
    }
}
