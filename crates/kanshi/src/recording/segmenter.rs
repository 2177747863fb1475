//! Recording segmenter
//!
//! Subscribes to a camera's frame hub and writes frames into segment files.
//! A segment closes when it reaches the maximum duration, when recording is
//! stopped, when the stream leaves `Running`, or when the segmenter stops.
//! Closing registers the segment with a single catalog insert.
//!
//! Two modes:
//! - continuous: a segment is open whenever frames are flowing
//! - event-based: armed by `start_recording(true)`, typically from the
//!   detection dispatcher
//!
//! A failed insert never deletes the file. The insert is retried on a bounded
//! backoff schedule; after the last attempt the file is left on disk and the
//! path is logged.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{SegmentSpec, SegmentWriter, SegmentWriterBackend};
use crate::capture::backoff::Backoff;
use crate::capture::queue::Subscription;
use crate::capture::supervisor::StreamState;
use crate::capture::FrameHub;
use crate::catalog::Catalog;
use crate::frame::{CameraId, Frame};
use crate::model::{Camera, CaptureSettings, NewRecording};
use crate::storage;
use crate::worker::WorkerHandle;

/// Minimum delay between attempts to open a segment after a writer failure
const OPEN_RETRY: Duration = Duration::from_secs(1);

const COMMAND_CAPACITY: usize = 32;

/// Segmenter tuning
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Root directory for segment files
    pub storage_root: PathBuf,
    /// A segment is closed once it has been open this long
    pub max_segment: Duration,
    /// Record whenever the stream is running
    pub continuous: bool,
    /// Delay schedule for retrying a failed catalog insert
    pub insert_retry: Backoff,
    /// Total insert attempts per segment, including the first
    pub insert_retry_attempts: u32,
    pub stop_grace: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./recordings"),
            max_segment: Duration::from_secs(3600),
            continuous: true,
            insert_retry: Backoff::new(Duration::from_secs(1), Duration::from_secs(16)),
            insert_retry_attempts: 5,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Snapshot of a segmenter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmenterStatus {
    pub camera_id: CameraId,
    /// A segment file is open
    pub recording: bool,
    /// The open segment (or the armed mode) is event-based
    pub event_based: bool,
    /// Recording is armed: a segment opens on the next frame
    pub armed: bool,
    pub current_path: Option<PathBuf>,
    pub segment_started_at: Option<DateTime<Utc>>,
    pub frames_in_segment: u64,
    pub segments_registered: u64,
    /// Closed segments waiting for a successful catalog insert
    pub pending_inserts: usize,
    pub last_error: Option<String>,
}

impl SegmenterStatus {
    fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            recording: false,
            event_based: false,
            armed: false,
            current_path: None,
            segment_started_at: None,
            frames_in_segment: 0,
            segments_registered: 0,
            pending_inserts: 0,
            last_error: None,
        }
    }
}

enum Command {
    Start {
        event_based: bool,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    StopEventBased {
        reply: oneshot::Sender<bool>,
    },
    Motion(f32),
}

/// Cloneable control surface of a running segmenter
#[derive(Clone)]
pub struct SegmenterHandle {
    camera_id: CameraId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SegmenterStatus>,
}

impl SegmenterHandle {
    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<bool>) -> Command) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Arm recording. Returns `false` if a segment is already open.
    pub async fn start_recording(&self, event_based: bool) -> bool {
        self.request(|reply| Command::Start { event_based, reply })
            .await
    }

    /// Close the open segment and disarm. Returns `false` if nothing was
    /// recording or armed.
    pub async fn stop_recording(&self) -> bool {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Like [`stop_recording`](Self::stop_recording), but only if the
    /// current recording is event-based.
    pub async fn stop_event_recording(&self) -> bool {
        self.request(|reply| Command::StopEventBased { reply }).await
    }

    /// Report a motion score for the open segment. Never blocks.
    pub fn note_motion(&self, score: f32) {
        let _ = self.commands.try_send(Command::Motion(score));
    }

    pub fn status(&self) -> SegmenterStatus {
        self.status.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.status.borrow().recording
    }

    /// Receiver notified on every status change
    pub fn watch_status(&self) -> watch::Receiver<SegmenterStatus> {
        self.status.clone()
    }
}

/// Owns one camera's segmenter task
pub struct Segmenter {
    handle: SegmenterHandle,
    worker: Option<WorkerHandle>,
    stop_grace: Duration,
}

/// What the worker needs from the rest of the triad
pub struct SegmenterDeps {
    pub hub: FrameHub,
    pub stream_state: watch::Receiver<StreamState>,
    pub writer: Arc<dyn SegmentWriterBackend>,
    pub catalog: Arc<dyn Catalog>,
}

impl Segmenter {
    /// Subscribe to the hub and spawn the worker
    pub fn start(camera: &Camera, deps: SegmenterDeps, config: SegmenterConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SegmenterStatus::new(camera.id.clone()));
        let stop_grace = config.stop_grace;

        let mode = if config.continuous {
            Mode::Continuous
        } else {
            Mode::Idle
        };
        let worker = Worker {
            camera_id: camera.id.clone(),
            settings: camera.settings.clone(),
            subscription: deps.hub.subscribe(),
            stream_state: deps.stream_state,
            writer: deps.writer,
            catalog: deps.catalog,
            commands: commands_rx,
            status: status_tx,
            mode,
            open: None,
            open_retry_at: None,
            pending: VecDeque::new(),
            segments_registered: 0,
            last_error: None,
            config,
        };
        worker.publish_status();

        let task = WorkerHandle::spawn(format!("segmenter:{}", camera.id), move |cancel| {
            worker.run(cancel)
        });
        info!(camera = %camera.id, "Segmenter started");

        Self {
            handle: SegmenterHandle {
                camera_id: camera.id.clone(),
                commands: commands_tx,
                status: status_rx,
            },
            worker: Some(task),
            stop_grace,
        }
    }

    pub fn handle(&self) -> SegmenterHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> SegmenterStatus {
        self.handle.status()
    }

    /// Close and register the open segment, then stop. Idempotent.
    pub async fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let clean = worker.stop(self.stop_grace).await;
        if !clean {
            warn!(camera = %self.handle.camera_id, "Segmenter abandoned after grace period");
        }
        clean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Continuous,
    EventBased,
}

struct OpenSegment {
    writer: Box<dyn SegmentWriter>,
    path: PathBuf,
    event_based: bool,
    start_time: DateTime<Utc>,
    opened_at: Instant,
    frames: u64,
    motion_score: Option<f32>,
}

struct PendingInsert {
    recording: NewRecording,
    attempts: u32,
    backoff: Backoff,
    retry_at: Instant,
}

struct Worker {
    camera_id: CameraId,
    settings: CaptureSettings,
    config: SegmenterConfig,
    subscription: Subscription,
    stream_state: watch::Receiver<StreamState>,
    writer: Arc<dyn SegmentWriterBackend>,
    catalog: Arc<dyn Catalog>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SegmenterStatus>,
    mode: Mode,
    open: Option<OpenSegment>,
    open_retry_at: Option<Instant>,
    pending: VecDeque<PendingInsert>,
    segments_registered: u64,
    last_error: Option<String>,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut state_open = true;
        let mut frames_open = true;

        loop {
            let retry_at = self.pending.front().map(|p| p.retry_at);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                changed = self.stream_state.changed(), if state_open => {
                    let state = match changed {
                        Ok(()) => *self.stream_state.borrow_and_update(),
                        Err(_) => {
                            state_open = false;
                            StreamState::Stopped
                        }
                    };
                    if state != StreamState::Running && self.open.is_some() {
                        self.close_segment("stream left running").await;
                    }
                }

                frame = self.subscription.recv(), if frames_open => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        frames_open = false;
                        self.close_segment("frame source closed").await;
                    }
                },

                _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                    self.retry_pending().await;
                }
            }
        }

        self.close_segment("segmenter stopping").await;
        self.drain_pending().await;
        debug!(camera = %self.camera_id, "Segmenter exiting");
    }

    fn publish_status(&self) {
        let open = self.open.as_ref();
        self.status.send_replace(SegmenterStatus {
            camera_id: self.camera_id.clone(),
            recording: open.is_some(),
            event_based: open.map_or(self.mode == Mode::EventBased, |s| s.event_based),
            armed: self.mode != Mode::Idle,
            current_path: open.map(|s| s.path.clone()),
            segment_started_at: open.map(|s| s.start_time),
            frames_in_segment: open.map_or(0, |s| s.frames),
            segments_registered: self.segments_registered,
            pending_inserts: self.pending.len(),
            last_error: self.last_error.clone(),
        });
    }

    fn set_error(&mut self, error: String) {
        self.last_error = Some(error);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { event_based, reply } => {
                // Event-based recording only starts when nothing records;
                // continuous recording takes over from event-based.
                let accepted = if event_based {
                    self.mode == Mode::Idle && self.open.is_none()
                } else {
                    self.mode != Mode::Continuous
                };
                if accepted {
                    self.mode = if event_based {
                        Mode::EventBased
                    } else {
                        Mode::Continuous
                    };
                    self.open_retry_at = None;
                    info!(camera = %self.camera_id, event_based, "Recording armed");
                    self.publish_status();
                }
                let _ = reply.send(accepted);
            }
            Command::Stop { reply } => {
                let active = self.open.is_some() || self.mode != Mode::Idle;
                self.mode = Mode::Idle;
                self.close_segment("recording stopped").await;
                self.publish_status();
                let _ = reply.send(active);
            }
            Command::StopEventBased { reply } => {
                let event_open = self.open.as_ref().is_some_and(|s| s.event_based);
                let event_armed = self.mode == Mode::EventBased;
                if event_armed {
                    self.mode = Mode::Idle;
                }
                if event_open {
                    self.close_segment("event recording ended").await;
                }
                if event_open || event_armed {
                    self.publish_status();
                }
                let _ = reply.send(event_open || event_armed);
            }
            Command::Motion(score) => {
                if let Some(segment) = self.open.as_mut() {
                    segment.motion_score = Some(segment.motion_score.map_or(score, |s| s.max(score)));
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        if self.open.is_none() {
            if self.mode == Mode::Idle {
                return;
            }
            if self.open_retry_at.is_some_and(|at| Instant::now() < at) {
                return;
            }
            if let Err(e) = self.open_segment().await {
                error!(camera = %self.camera_id, error = %format!("{e:#}"), "Failed to open segment");
                self.set_error(format!("open segment: {e:#}"));
                self.open_retry_at = Some(Instant::now() + OPEN_RETRY);
                self.publish_status();
                return;
            }
        }

        let frame = match frame.resized(self.settings.resolution) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(camera = %self.camera_id, error = %e, "Dropping frame that could not be scaled");
                return;
            }
        };

        let Some(segment) = self.open.as_mut() else {
            return;
        };
        if let Err(e) = segment.writer.write_frame(&frame).await {
            error!(
                camera = %self.camera_id,
                path = %segment.path.display(),
                error = %format!("{e:#}"),
                "Segment write failed, closing segment"
            );
            self.set_error(format!("write segment: {e:#}"));
            self.open_retry_at = Some(Instant::now() + OPEN_RETRY);
            self.close_segment("write failed").await;
            return;
        }
        segment.frames += 1;
        let first_frame = segment.frames == 1;
        let elapsed = segment.opened_at.elapsed();

        if elapsed >= self.config.max_segment {
            self.close_segment("maximum duration reached").await;
        } else if first_frame {
            self.publish_status();
        }
    }

    async fn open_segment(&mut self) -> anyhow::Result<()> {
        let start_time = Utc::now();
        let path = storage::unique_segment_path(
            &self.config.storage_root,
            &self.camera_id,
            start_time,
            self.writer.extension(),
        )
        .await;
        if let Some(dir) = path.parent() {
            storage::ensure_dir(dir).await?;
        }
        let spec = SegmentSpec::from(&self.settings);
        let writer = self.writer.open_segment(&path, &spec).await?;

        info!(
            camera = %self.camera_id,
            path = %path.display(),
            event_based = self.mode == Mode::EventBased,
            "Segment opened"
        );
        self.open = Some(OpenSegment {
            writer,
            path,
            event_based: self.mode == Mode::EventBased,
            start_time,
            opened_at: Instant::now(),
            frames: 0,
            motion_score: None,
        });
        self.open_retry_at = None;
        Ok(())
    }

    /// Finalize the open segment (if any) and register it
    async fn close_segment(&mut self, reason: &str) {
        let Some(mut segment) = self.open.take() else {
            return;
        };

        let reported = match segment.writer.close().await {
            Ok(size) => Some(size),
            Err(e) => {
                warn!(
                    camera = %self.camera_id,
                    path = %segment.path.display(),
                    error = %format!("{e:#}"),
                    "Segment writer failed to close cleanly"
                );
                None
            }
        };
        let end_time = Utc::now();

        let on_disk = tokio::fs::metadata(&segment.path).await.map(|m| m.len());
        let size = match (on_disk, reported) {
            (Ok(disk), Some(reported)) if disk != reported => {
                debug!(
                    camera = %self.camera_id,
                    reported,
                    on_disk = disk,
                    "Writer size differs from disk, using disk size"
                );
                disk
            }
            (Ok(disk), _) => disk,
            (Err(e), _) => {
                error!(
                    camera = %self.camera_id,
                    path = %segment.path.display(),
                    error = %e,
                    "Closed segment is missing on disk, not registering"
                );
                self.set_error(format!("segment missing: {e}"));
                self.publish_status();
                return;
            }
        };

        if segment.frames == 0 {
            debug!(
                camera = %self.camera_id,
                path = %segment.path.display(),
                "Discarding empty segment"
            );
            if let Err(e) = storage::remove_file_if_exists(&segment.path).await {
                warn!(camera = %self.camera_id, error = %e, "Failed to delete empty segment");
            }
            self.publish_status();
            return;
        }

        if end_time <= segment.start_time {
            warn!(
                camera = %self.camera_id,
                start = %segment.start_time,
                end = %end_time,
                "Wall clock went backwards during segment, clamping end time"
            );
        }
        let recording = match NewRecording::new(
            self.camera_id.clone(),
            segment.start_time,
            segment_end_time(segment.start_time, end_time),
            segment.path.clone(),
            size,
            segment.event_based,
        ) {
            Ok(recording) => recording.with_motion_score(segment.motion_score),
            Err(e) => {
                error!(
                    camera = %self.camera_id,
                    path = %segment.path.display(),
                    error = %e,
                    "Segment not registered; file left on disk"
                );
                self.set_error(format!("register segment: {e}"));
                self.publish_status();
                return;
            }
        };

        match self.catalog.insert_recording(&recording).await {
            Ok(row) => {
                self.segments_registered += 1;
                info!(
                    camera = %self.camera_id,
                    recording = %row.id,
                    path = %row.file_path.display(),
                    frames = segment.frames,
                    duration_secs = row.duration_secs,
                    bytes = row.file_size_bytes,
                    reason,
                    "Segment registered"
                );
            }
            Err(e) => {
                let mut backoff = self.config.insert_retry.clone();
                backoff.reset();
                let delay = backoff.next_delay();
                warn!(
                    camera = %self.camera_id,
                    path = %recording.file_path().display(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to register segment, will retry"
                );
                self.set_error(format!("register segment: {e}"));
                self.pending.push_back(PendingInsert {
                    recording,
                    attempts: 1,
                    backoff,
                    retry_at: Instant::now() + delay,
                });
            }
        }
        self.publish_status();
    }

    async fn retry_pending(&mut self) {
        let Some(mut pending) = self.pending.pop_front() else {
            return;
        };
        pending.attempts += 1;
        match self.catalog.insert_recording(&pending.recording).await {
            Ok(row) => {
                self.segments_registered += 1;
                info!(
                    camera = %self.camera_id,
                    recording = %row.id,
                    path = %row.file_path.display(),
                    attempts = pending.attempts,
                    "Segment registered after retry"
                );
            }
            Err(e) if pending.attempts >= self.config.insert_retry_attempts => {
                error!(
                    camera = %self.camera_id,
                    path = %pending.recording.file_path().display(),
                    attempts = pending.attempts,
                    error = %e,
                    "Giving up registering segment; file left on disk"
                );
                self.set_error(format!("register segment: {e}"));
            }
            Err(e) => {
                let delay = pending.backoff.next_delay();
                warn!(
                    camera = %self.camera_id,
                    path = %pending.recording.file_path().display(),
                    attempts = pending.attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to register segment, will retry"
                );
                pending.retry_at = Instant::now() + delay;
                // Keep the queue ordered by retry time
                let at = self
                    .pending
                    .iter()
                    .position(|p| p.retry_at > pending.retry_at)
                    .unwrap_or(self.pending.len());
                self.pending.insert(at, pending);
            }
        }
        self.publish_status();
    }

    /// One final attempt for every pending insert before exiting
    async fn drain_pending(&mut self) {
        while let Some(pending) = self.pending.pop_front() {
            if let Err(e) = self.catalog.insert_recording(&pending.recording).await {
                error!(
                    camera = %self.camera_id,
                    path = %pending.recording.file_path().display(),
                    error = %e,
                    "Segment not registered before shutdown; file left on disk"
                );
            } else {
                self.segments_registered += 1;
            }
        }
        self.publish_status();
    }
}

/// End time for a segment that holds frames. Never at or before `start`, so
/// a wall clock step backwards still yields a registrable interval.
fn segment_end_time(start: DateTime<Utc>, closed_at: DateTime<Utc>) -> DateTime<Utc> {
    closed_at.max(start + TimeDelta::microseconds(1))
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_end_time_survives_clock_steps() {
        let start = Utc::now();
        let later = start + TimeDelta::seconds(30);
        assert_eq!(segment_end_time(start, later), later);

        // Clock stepped back (or did not advance) while frames were written
        for closed_at in [start, start - TimeDelta::seconds(5)] {
            let end = segment_end_time(start, closed_at);
            assert_eq!(end, start + TimeDelta::microseconds(1));
            let recording = NewRecording::new(
                CameraId::new("porch").unwrap(),
                start,
                end,
                PathBuf::from("/tmp/porch/seg.mp4"),
                1024,
                false,
            )
            .unwrap();
            assert!(recording.end_time() > recording.start_time());
        }
    }
}
