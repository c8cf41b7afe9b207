use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Number of undelivered messages a subscriber may fall behind before it
/// starts losing the oldest ones.
const CHANNEL_CAPACITY: usize = 256;

/// A single event delivered on a relay channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel: String,
    pub event: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("relay channel closed")]
    Closed,
    #[error("relay does not support client publishing")]
    PublishUnsupported,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Fan-out publish/subscribe relay.
///
/// Every subscriber of a channel receives every event published on it,
/// including events published by the subscriber itself. Delivery is at most
/// once; a slow subscriber may miss events.
pub trait Bus: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage>;

    /// Publishes an event and returns the number of subscribers it reached.
    fn publish(&self, channel: &str, event: &str, payload: Bytes) -> BusResult<usize>;

    /// Releases a channel subscription held by this relay connection.
    fn unsubscribe(&self, _channel: &str) {}
}

/// In-process relay used by tests, demos and the local room service.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: parking_lot::RwLock<HashMap<String, broadcast::Sender<RelayMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<RelayMessage> {
        if let Some(sender) = self.channels.read().get(channel) {
            return sender.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, event: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(channel);
        let message = RelayMessage {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        };
        // A send error only means nobody is listening right now.
        Ok(sender.send(message).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_fans_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("web");
        let mut second = bus.subscribe("web");

        let delivered = bus
            .publish("web", "message", Bytes::from_static(b"ping"))
            .expect("publish ok");
        assert_eq!(delivered, 2);

        for sub in [&mut first, &mut second] {
            let msg = sub.recv().await.expect("receive ok");
            assert_eq!(msg.channel, "web");
            assert_eq!(msg.event, "message");
            assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        let delivered = bus
            .publish("chat-42", "user-joined", Bytes::from_static(b"{}"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = LocalBus::new();
        let mut room = bus.subscribe("chat-42");
        bus.publish("chat-7", "user-joined", Bytes::from_static(b"other"))
            .expect("publish ok");
        bus.publish("chat-42", "user-joined", Bytes::from_static(b"mine"))
            .expect("publish ok");

        let msg = room.recv().await.expect("receive ok");
        assert_eq!(msg.payload, Bytes::from_static(b"mine"));
        assert!(room.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_stop_counting() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("web");
        assert_eq!(bus.subscriber_count("web"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("web"), 0);
    }
}
