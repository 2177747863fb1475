//! Per-camera frame hub
//!
//! The hub sits between one capture session and every consumer of that
//! camera's frames. It keeps a single "latest frame" slot for samplers and
//! pushes each frame into bounded per-subscriber queues for consumers that
//! need every frame they can get (the segmenter).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::fps::FpsMeter;
use super::queue::{FrameQueue, SubscriberMap, Subscription, SubscriptionId};
use crate::backend::{CaptureHandle, ReadOutcome};
use crate::frame::{CameraId, Frame};

/// Why a pull loop returned
#[derive(Debug)]
pub enum PullExit {
    /// The cancellation token fired
    Cancelled,
    /// The source reported end of stream
    EndOfStream,
    /// A read failed
    Failed(anyhow::Error),
}

/// Hub counters (returned as a snapshot from atomic counters)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub frames_published: u64,
    pub frames_since_connect: u64,
    pub fps: f64,
    pub subscribers: usize,
    /// Frames dropped across current subscribers
    pub frames_dropped: u64,
}

struct Shared {
    camera_id: CameraId,
    latest: watch::Sender<Option<Frame>>,
    subscribers: Arc<SubscriberMap>,
    queue_capacity: usize,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    frames_since_connect: AtomicU64,
    fps_bits: AtomicU64,
}

/// Latest-frame slot plus drop-oldest fan-out for one camera.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FrameHub {
    shared: Arc<Shared>,
}

impl FrameHub {
    pub fn new(camera_id: CameraId, queue_capacity: usize) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                camera_id,
                latest,
                subscribers: Arc::new(Mutex::new(HashMap::new())),
                queue_capacity: queue_capacity.max(1),
                next_subscription: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                frames_since_connect: AtomicU64::new(0),
                fps_bits: AtomicU64::new(0f64.to_bits()),
            }),
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.shared.camera_id
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Arc<FrameQueue>>> {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Most recent frame, or `None` before the first one. Never blocks.
    pub fn latest(&self) -> Option<Frame> {
        self.shared.latest.borrow().clone()
    }

    /// Receiver that is notified every time the latest frame changes
    pub fn watch_latest(&self) -> watch::Receiver<Option<Frame>> {
        self.shared.latest.subscribe()
    }

    /// Register a new bounded subscriber queue
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(FrameQueue::new(self.shared.queue_capacity));
        self.subscribers().insert(id, queue.clone());
        debug!(camera = %self.shared.camera_id, subscription = %id, "Subscriber added");
        Subscription::new(id, queue, Arc::downgrade(&self.shared.subscribers))
    }

    /// Remove a subscriber; its pending frames remain readable, then it ends.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers().remove(&id) {
            Some(queue) => {
                queue.close();
                debug!(camera = %self.shared.camera_id, subscription = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Stamp the next sequence number on `frame`, store it as latest and fan
    /// it out. Never blocks on slow subscribers.
    pub fn publish(&self, frame: Frame) -> Frame {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = frame.with_sequence(sequence);
        self.shared.latest.send_replace(Some(frame.clone()));
        self.shared.frames_since_connect.fetch_add(1, Ordering::Relaxed);

        for (id, queue) in self.subscribers().iter() {
            if let Some(evicted) = queue.push(frame.clone()) {
                trace!(
                    camera = %self.shared.camera_id,
                    subscription = %id,
                    evicted = evicted.sequence,
                    "Subscriber behind, dropped oldest frame"
                );
            }
        }
        frame
    }

    /// Frames per second over the last completed measurement window
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.shared.fps_bits.load(Ordering::Relaxed))
    }

    fn set_fps(&self, fps: f64) {
        self.shared.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn frames_since_connect(&self) -> u64 {
        self.shared.frames_since_connect.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HubStats {
        let subscribers = self.subscribers();
        HubStats {
            frames_published: self.shared.sequence.load(Ordering::Relaxed),
            frames_since_connect: self.frames_since_connect(),
            fps: self.fps(),
            subscribers: subscribers.len(),
            frames_dropped: subscribers.values().map(|q| q.dropped()).sum(),
        }
    }

    /// Pull frames from `handle` until cancelled, end of stream or a read error.
    ///
    /// Resets the per-connection counters on entry and the fps gauge on exit.
    pub async fn run(&self, handle: &mut dyn CaptureHandle, cancel: &CancellationToken) -> PullExit {
        self.shared.frames_since_connect.store(0, Ordering::Relaxed);
        let mut meter = FpsMeter::new();

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break PullExit::Cancelled,

                outcome = handle.read_frame() => match outcome {
                    Ok(ReadOutcome::Frame(frame)) => {
                        self.publish(frame);
                        if let Some(fps) = meter.record() {
                            self.set_fps(fps);
                        }
                    }
                    Ok(ReadOutcome::EndOfStream) => break PullExit::EndOfStream,
                    Err(e) => break PullExit::Failed(e),
                },
            }
        };

        self.set_fps(0.0);
        exit
    }
}
