//! Bounded drop-oldest frame queue
//!
//! Publishing never blocks: when a queue is full its oldest unread frame is
//! discarded to make room and the drop is counted. A slow consumer therefore
//! sees frames in capture order with gaps, and never more than `capacity`
//! frames behind.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

use crate::frame::Frame;

/// Identifies one subscriber of a frame hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Subscriber queues of one hub, keyed by id
pub(crate) type SubscriberMap = Mutex<HashMap<SubscriptionId, Arc<FrameQueue>>>;

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Single-consumer queue with a drop-oldest overwrite policy
pub struct FrameQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    // The lock is never held across an await or a panic-prone call, so a
    // poisoned mutex still holds a consistent queue.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `frame`, evicting and returning the oldest frame when full.
    ///
    /// Frames pushed after [`FrameQueue::close`] are discarded.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            let evicted = if state.frames.len() >= self.capacity {
                state.frames.pop_front()
            } else {
                None
            };
            state.frames.push_back(frame);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    /// Wait for the next frame. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded by the overwrite policy so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting frames and wake the consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// A registered consumer of a frame hub.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: SubscriptionId,
    queue: Arc<FrameQueue>,
    subscribers: Weak<SubscriberMap>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        queue: Arc<FrameQueue>,
        subscribers: Weak<SubscriberMap>,
    ) -> Self {
        Self {
            id,
            queue,
            subscribers,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next frame in capture order; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<Frame> {
        self.queue.pop().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.queue.try_pop()
    }

    /// Frames waiting to be read
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Frames this subscriber missed because it fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            let mut map = subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        let res = Resolution::new(2, 2);
        Frame::rgb(res, Bytes::from(vec![0u8; res.rgb_len()]))
            .unwrap()
            .with_sequence(seq)
    }

    #[test]
    fn full_queue_drops_oldest() {
        let q = FrameQueue::new(3);
        for seq in 1..=5 {
            q.push(frame(seq));
            assert!(q.len() <= 3);
        }
        assert_eq!(q.dropped(), 2);
        let seqs: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn push_returns_evicted_frame() {
        let q = FrameQueue::new(1);
        assert!(q.push(frame(1)).is_none());
        assert_eq!(q.push(frame(2)).map(|f| f.sequence), Some(1));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(FrameQueue::new(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await.map(|f| f.sequence) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(frame(7));
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = FrameQueue::new(4);
        q.push(frame(1));
        q.close();
        assert!(q.push(frame(2)).is_none());
        assert_eq!(q.pop().await.map(|f| f.sequence), Some(1));
        assert!(q.pop().await.is_none());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let map: Arc<SubscriberMap> = Arc::new(Mutex::new(HashMap::new()));
        let queue = Arc::new(FrameQueue::new(2));
        let id = SubscriptionId(1);
        map.lock().unwrap().insert(id, queue.clone());
        let sub = Subscription::new(id, queue, Arc::downgrade(&map));
        assert_eq!(sub.id(), id);
        drop(sub);
        assert!(map.lock().unwrap().is_empty());
    }
}
