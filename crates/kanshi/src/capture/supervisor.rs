//! Stream supervisor: keeps one camera connected
//!
//! ```text
//! Stopped -> Connecting -> Running -> Error -> Connecting (after backoff) ...
//!    ^                                                              |
//!    +------------------------- stop() -----------------------------+
//! ```
//!
//! There is no retry limit; the supervisor keeps reconnecting until stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::hub::{FrameHub, PullExit};
use crate::backend::CaptureBackend;
use crate::frame::CameraId;
use crate::model::{Camera, CaptureSettings};
use crate::worker::WorkerHandle;

/// Connection state of one camera stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Connecting,
    Running,
    Error,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Stopped => "stopped",
            StreamState::Connecting => "connecting",
            StreamState::Running => "running",
            StreamState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-subscriber frame queue depth
    pub queue_capacity: usize,
    /// Upper bound on a single open attempt
    pub open_timeout: Duration,
    /// Delay schedule between reconnect attempts
    pub backoff: Backoff,
    /// How long `stop` waits for the task before abandoning it
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            open_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Status report for one stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub camera_id: CameraId,
    pub state: StreamState,
    pub fps: f64,
    pub frames_since_connect: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    fn set_error(&self, error: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Everything the supervising task needs, shared with the handle
#[derive(Clone)]
struct Context {
    camera_id: CameraId,
    source_uri: String,
    settings: CaptureSettings,
    backend: Arc<dyn CaptureBackend>,
    config: SupervisorConfig,
    hub: FrameHub,
    state: Arc<watch::Sender<StreamState>>,
    counters: Arc<Counters>,
}

impl Context {
    fn set_state(&self, state: StreamState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(camera = %self.camera_id, from = %previous, to = %state, "Stream state changed");
        }
    }

    /// Record a failure and wait out the backoff. Returns `false` if cancelled.
    async fn fail_and_wait(
        &self,
        error: String,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> bool {
        self.set_state(StreamState::Error);
        let delay = backoff.next_delay();
        warn!(
            camera = %self.camera_id,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Stream error, reconnecting after backoff"
        );
        self.counters.set_error(error);

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => {
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    async fn supervise(self, cancel: CancellationToken) {
        let mut backoff = self.config.backoff.clone();
        backoff.reset();

        while !cancel.is_cancelled() {
            self.set_state(StreamState::Connecting);
            debug!(camera = %self.camera_id, uri = %self.source_uri, "Opening stream");

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(
                    self.config.open_timeout,
                    self.backend.open(&self.source_uri, &self.settings),
                ) => r,
            };

            let mut handle = match opened {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => {
                    if !self.fail_and_wait(format!("open failed: {e:#}"), &mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    let error = format!(
                        "open timed out after {}ms",
                        self.config.open_timeout.as_millis()
                    );
                    if !self.fail_and_wait(error, &mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            backoff.reset();
            self.set_state(StreamState::Running);
            info!(camera = %self.camera_id, uri = %self.source_uri, "Stream connected");

            let exit = self.hub.run(handle.as_mut(), &cancel).await;

            match tokio::time::timeout(self.config.open_timeout, handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(camera = %self.camera_id, error = %e, "Failed to close capture"),
                Err(_) => warn!(camera = %self.camera_id, "Timed out closing capture"),
            }

            let error = match exit {
                PullExit::Cancelled => break,
                PullExit::EndOfStream => "end of stream".to_string(),
                PullExit::Failed(e) => format!("read failed: {e:#}"),
            };
            if !self.fail_and_wait(error, &mut backoff, &cancel).await {
                break;
            }
        }

        self.set_state(StreamState::Stopped);
        debug!(camera = %self.camera_id, "Supervisor exiting");
    }
}

/// Owns one camera's capture task and frame hub
pub struct StreamSupervisor {
    ctx: Context,
    worker: Option<WorkerHandle>,
}

impl StreamSupervisor {
    pub fn new(camera: &Camera, backend: Arc<dyn CaptureBackend>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(StreamState::Stopped);
        let hub = FrameHub::new(camera.id.clone(), config.queue_capacity);
        Self {
            ctx: Context {
                camera_id: camera.id.clone(),
                source_uri: camera.source_uri.clone(),
                settings: camera.settings.clone(),
                backend,
                config,
                hub,
                state: Arc::new(state),
                counters: Arc::new(Counters::default()),
            },
            worker: None,
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.ctx.camera_id
    }

    /// The camera's frame hub. Valid across reconnects.
    pub fn hub(&self) -> &FrameHub {
        &self.ctx.hub
    }

    pub fn state(&self) -> StreamState {
        *self.ctx.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.ctx.state.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Spawn the supervising task. No-op if already running.
    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }
        self.ctx.set_state(StreamState::Connecting);
        let ctx = self.ctx.clone();
        self.worker = Some(WorkerHandle::spawn(
            format!("supervisor:{}", self.ctx.camera_id),
            move |cancel| ctx.supervise(cancel),
        ));
        info!(camera = %self.ctx.camera_id, "Supervisor started");
    }

    /// Cancel the task from any state and wait at most the grace period.
    ///
    /// Idempotent. Returns `false` if the task had to be abandoned.
    pub async fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let clean = worker.stop(self.ctx.config.stop_grace).await;
        self.ctx.set_state(StreamState::Stopped);
        if clean {
            info!(camera = %self.ctx.camera_id, "Supervisor stopped");
        } else {
            warn!(camera = %self.ctx.camera_id, "Supervisor abandoned after grace period");
        }
        clean
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            camera_id: self.ctx.camera_id.clone(),
            state: self.state(),
            fps: self.ctx.hub.fps(),
            frames_since_connect: self.ctx.hub.frames_since_connect(),
            reconnects: self.ctx.counters.reconnects.load(Ordering::Relaxed),
            last_error: self.ctx.counters.last_error(),
        }
    }
}
