//! Detection dispatcher
//!
//! Samples a camera's latest frame at a throttled cadence, runs motion scoring
//! and object detection on it, and turns results into catalog events that are
//! also pushed to live consumers. Optionally drives event-based recording.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::motion::{MotionDetector, MotionSettings};
use super::suppress::Suppressor;
use crate::backend::{Detection, InferenceBackend};
use crate::capture::FrameHub;
use crate::catalog::Catalog;
use crate::frame::{CameraId, Frame};
use crate::live::{EventSink, LiveMessage};
use crate::model::{Camera, DetectionPayload, EventKind, NewEvent};
use crate::recording::SegmenterHandle;
use crate::worker::WorkerHandle;

/// Label used for motion events
pub const MOTION_LABEL: &str = "motion";

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Run the inference backend on samples
    pub detection_enabled: bool,
    /// Labels to keep; empty keeps everything
    pub classes: Vec<String>,
    /// Minimum confidence to keep a detection
    pub confidence: f32,
    /// Time between samples
    pub sample_interval: Duration,
    pub suppression_window: Duration,
    /// Open event-based segments on activity when nothing is recording
    pub event_recording: bool,
    /// Close an event-based segment after this long without activity
    pub quiet_period: Duration,
    pub inference_timeout: Duration,
    /// Frame differencing; `None` disables motion events
    pub motion: Option<MotionSettings>,
    pub stop_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            classes: Vec::new(),
            confidence: 0.5,
            sample_interval: Duration::from_millis(100),
            suppression_window: Duration::from_secs(5),
            event_recording: false,
            quiet_period: Duration::from_secs(10),
            inference_timeout: Duration::from_secs(2),
            motion: Some(MotionSettings::default()),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Detection engine info for one camera
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherStatus {
    pub camera_id: CameraId,
    pub model: String,
    pub detection_enabled: bool,
    pub motion_enabled: bool,
    pub classes: Vec<String>,
    pub confidence: f32,
    pub samples: u64,
    pub inference_failures: u64,
    pub events_emitted: u64,
    pub suppressed: u64,
    pub last_motion_score: Option<f32>,
    /// An event-based segment opened by this dispatcher is in progress
    pub event_recording_active: bool,
}

#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    inference_failures: AtomicU64,
    events_emitted: AtomicU64,
    suppressed: AtomicU64,
    event_recording_active: AtomicBool,
    last_motion_score: Mutex<Option<f32>>,
}

impl Counters {
    fn set_motion(&self, score: f32) {
        *self
            .last_motion_score
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(score);
    }

    fn motion(&self) -> Option<f32> {
        *self
            .last_motion_score
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What the worker needs from the rest of the triad
pub struct DispatcherDeps {
    pub hub: FrameHub,
    pub inference: Arc<dyn InferenceBackend>,
    pub catalog: Arc<dyn Catalog>,
    pub sink: Arc<dyn EventSink>,
    pub segmenter: SegmenterHandle,
}

/// Owns one camera's detection task
pub struct Dispatcher {
    camera_id: CameraId,
    model: String,
    config: DispatcherConfig,
    counters: Arc<Counters>,
    worker: Option<WorkerHandle>,
}

impl Dispatcher {
    pub fn start(camera: &Camera, deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        let counters = Arc::new(Counters::default());
        let model = deps.inference.model_name().to_string();
        let worker = Worker {
            camera_id: camera.id.clone(),
            suppressor: Suppressor::new(config.suppression_window),
            motion: config.motion.map(MotionDetector::new),
            config: config.clone(),
            deps,
            counters: counters.clone(),
            last_sequence: None,
            last_activity: None,
            opened_recording: false,
        };
        let task = WorkerHandle::spawn(format!("dispatcher:{}", camera.id), move |cancel| {
            worker.run(cancel)
        });
        info!(
            camera = %camera.id,
            model = %model,
            detection = config.detection_enabled,
            motion = config.motion.is_some(),
            "Dispatcher started"
        );
        Self {
            camera_id: camera.id.clone(),
            model,
            config,
            counters,
            worker: Some(task),
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            camera_id: self.camera_id.clone(),
            model: self.model.clone(),
            detection_enabled: self.config.detection_enabled,
            motion_enabled: self.config.motion.is_some(),
            classes: self.config.classes.clone(),
            confidence: self.config.confidence,
            samples: self.counters.samples.load(Ordering::Relaxed),
            inference_failures: self.counters.inference_failures.load(Ordering::Relaxed),
            events_emitted: self.counters.events_emitted.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            last_motion_score: self.counters.motion(),
            event_recording_active: self.counters.event_recording_active.load(Ordering::Relaxed),
        }
    }

    /// Idempotent
    pub async fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let clean = worker.stop(self.config.stop_grace).await;
        if !clean {
            warn!(camera = %self.camera_id, "Dispatcher abandoned after grace period");
        }
        clean
    }
}

struct Worker {
    camera_id: CameraId,
    config: DispatcherConfig,
    deps: DispatcherDeps,
    counters: Arc<Counters>,
    suppressor: Suppressor,
    motion: Option<MotionDetector>,
    last_sequence: Option<u64>,
    last_activity: Option<Instant>,
    /// This dispatcher asked the segmenter for the current event-based segment
    opened_recording: bool,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.sample() => {}
                    }
                }
            }
        }
        debug!(camera = %self.camera_id, "Dispatcher exiting");
    }

    async fn sample(&mut self) {
        let frame = self
            .deps
            .hub
            .latest()
            .filter(|f| Some(f.sequence) != self.last_sequence);
        if let Some(frame) = frame {
            self.last_sequence = Some(frame.sequence);
            let samples = self.counters.samples.fetch_add(1, Ordering::Relaxed) + 1;
            if samples % 100 == 0 {
                self.suppressor.prune(Instant::now());
            }
            self.process(frame).await;
        }
        self.check_quiet_period().await;
    }

    async fn process(&mut self, frame: Frame) {
        let pass_start = frame.captured_at;
        let now = Instant::now();
        let mut activity = false;
        let mut admitted: Vec<(EventKind, DetectionPayload)> = Vec::new();

        if let Some(detector) = self.motion.as_mut() {
            if let Some(reading) = detector.update(&frame) {
                self.counters.set_motion(reading.score);
                if reading.motion {
                    activity = true;
                    self.deps.segmenter.note_motion(reading.score);
                    if self.suppressor.admit(&self.camera_id, MOTION_LABEL, now) {
                        admitted.push((
                            EventKind::Motion,
                            DetectionPayload {
                                label: MOTION_LABEL.to_string(),
                                confidence: reading.score.clamp(0.0, 1.0),
                                bbox: None,
                                area: reading.changed_pixels as f32,
                            },
                        ));
                    } else {
                        self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if self.config.detection_enabled {
            for detection in self.detect(&frame).await {
                activity = true;
                if self.suppressor.admit(&self.camera_id, &detection.label, now) {
                    admitted.push((
                        EventKind::ObjectDetection,
                        DetectionPayload {
                            area: detection.bbox.area(),
                            label: detection.label,
                            confidence: detection.confidence,
                            bbox: Some(detection.bbox),
                        },
                    ));
                } else {
                    self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if activity {
            self.last_activity = Some(now);
            self.maybe_start_recording().await;
        }
        if admitted.is_empty() {
            return;
        }

        let pass_end = Utc::now().max(pass_start);
        for (kind, payload) in admitted {
            let label = payload.label.clone();
            let event = match NewEvent::new(self.camera_id.clone(), kind, payload, pass_start, pass_end) {
                // The catalog links it to an overlapping recording
                Ok(event) => event,
                Err(e) => {
                    warn!(camera = %self.camera_id, label = %label, error = %e, "Discarding invalid event");
                    continue;
                }
            };
            match self.deps.catalog.insert_event(&event).await {
                Ok(event) => {
                    self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        camera = %self.camera_id,
                        event = %event.id,
                        kind = event.kind.as_str(),
                        label = %event.label,
                        confidence = event.confidence,
                        "Event recorded"
                    );
                    self.deps.sink.publish(LiveMessage::Event(event));
                }
                Err(e) => {
                    warn!(camera = %self.camera_id, label = %label, error = %e, "Failed to record event");
                }
            }
        }
    }

    /// Run inference and keep detections that pass the local filters
    async fn detect(&self, frame: &Frame) -> Vec<Detection> {
        let call = self
            .deps
            .inference
            .detect(frame, self.config.confidence, &self.config.classes);
        let detections = match tokio::time::timeout(self.config.inference_timeout, call).await {
            Ok(Ok(detections)) => detections,
            Ok(Err(e)) => {
                self.counters.inference_failures.fetch_add(1, Ordering::Relaxed);
                warn!(camera = %self.camera_id, error = %format!("{e:#}"), "Inference failed");
                return Vec::new();
            }
            Err(_) => {
                self.counters.inference_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    camera = %self.camera_id,
                    timeout_ms = self.config.inference_timeout.as_millis() as u64,
                    "Inference timed out"
                );
                return Vec::new();
            }
        };
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.config.confidence)
            .filter(|d| self.config.classes.is_empty() || self.config.classes.contains(&d.label))
            .collect()
    }

    async fn maybe_start_recording(&mut self) {
        if !self.config.event_recording || self.opened_recording {
            return;
        }
        if self.deps.segmenter.is_recording() {
            return;
        }
        if self.deps.segmenter.start_recording(true).await {
            self.opened_recording = true;
            self.counters
                .event_recording_active
                .store(true, Ordering::Relaxed);
            info!(camera = %self.camera_id, "Event-based recording requested");
        }
    }

    async fn check_quiet_period(&mut self) {
        if !self.opened_recording {
            return;
        }
        // Someone else stopped or replaced the recording
        let status = self.deps.segmenter.status();
        if !status.armed || !status.event_based {
            self.release_recording();
            return;
        }
        let quiet = self
            .last_activity
            .map_or(true, |at| at.elapsed() >= self.config.quiet_period);
        if quiet {
            if self.deps.segmenter.stop_event_recording().await {
                info!(camera = %self.camera_id, "Event-based recording ended after quiet period");
            }
            self.release_recording();
        }
    }

    fn release_recording(&mut self) {
        self.opened_recording = false;
        self.counters
            .event_recording_active
            .store(false, Ordering::Relaxed);
    }
}
