//! Live fan-out of events and status to UI/API consumers

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::Event;
use crate::registry::CameraStatus;

/// Message pushed to live consumers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveMessage {
    /// A newly persisted event
    Event(Event),
    /// Periodic status snapshot of every running camera
    Status(Vec<CameraStatus>),
}

/// Destination for live messages. Delivery and retry are the sink's concern.
pub trait EventSink: Send + Sync {
    fn publish(&self, message: LiveMessage);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _message: LiveMessage) {}
}

/// Broadcast hub for live messages.
///
/// Slow subscribers lag and miss messages rather than slowing publishers.
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<LiveMessage>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for LiveHub {
    fn publish(&self, message: LiveMessage) {
        match self.tx.send(message) {
            Ok(n) => debug!(subscribers = n, "Live message published"),
            // No subscribers - that's okay
            Err(_) => debug!("No live subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_hub_delivers_to_subscribers() {
        let hub = LiveHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish(LiveMessage::Status(Vec::new()));
        match rx.recv().await.unwrap() {
            LiveMessage::Status(list) => assert!(list.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let hub = LiveHub::new(8);
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(LiveMessage::Status(Vec::new()));
    }

    #[test]
    fn status_message_serializes_with_tag() {
        let json = serde_json::to_value(LiveMessage::Status(Vec::new())).unwrap();
        assert_eq!(json["type"], "status");
        assert!(json["data"].as_array().unwrap().is_empty());
    }
}
