//! Relay client: subscribes to the room and global topics and turns relay
//! events into membership notifications and decoded envelopes.

use std::sync::Arc;

use parking_lot::Mutex;
use relay_bus::{Bus, RelayMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::signaling::{self, Envelope};

pub mod pusher;

/// Topic every participant listens on for signaling envelopes.
pub const GLOBAL_TOPIC: &str = "web";
/// Event carrying membership announcements on a room topic.
pub const MEMBERSHIP_EVENT: &str = "user-joined";
/// Event carrying an encoded envelope on the global topic.
pub const SIGNAL_EVENT: &str = "message";

pub fn room_topic(room: &str) -> String {
    format!("chat-{room}")
}

/// Someone registered in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub room: String,
    #[serde(rename = "newUsername")]
    pub identity: String,
}

pub type MembershipHandler = Arc<dyn Fn(MembershipEvent) + Send + Sync>;
pub type SignalHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    membership: Option<MembershipHandler>,
    signal: Option<SignalHandler>,
}

struct Subscription {
    room_topic: String,
    global_topic: String,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RelayClient {
    bus: Arc<dyn Bus>,
    handlers: Arc<Mutex<Handlers>>,
    active: Mutex<Option<Subscription>>,
}

impl RelayClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            handlers: Arc::new(Mutex::new(Handlers::default())),
            active: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    pub fn on_membership(&self, handler: MembershipHandler) {
        self.handlers.lock().membership = Some(handler);
    }

    pub fn on_signal(&self, handler: SignalHandler) {
        self.handlers.lock().signal = Some(handler);
    }

    pub fn is_joined(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Subscribes to both topics. Events published after this returns are
    /// delivered to the registered handlers. Joining again replaces the
    /// previous subscription. Must be called from within a tokio runtime.
    pub fn join(&self, room_topic: &str, global_topic: &str) {
        self.leave();

        let membership_rx = self.bus.subscribe(room_topic);
        let signal_rx = self.bus.subscribe(global_topic);

        let handlers = Arc::clone(&self.handlers);
        let membership_task = spawn_forwarder(membership_rx, MEMBERSHIP_EVENT, move |message| {
            let event = match serde_json::from_slice::<MembershipEvent>(&message.payload) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        target = "relay",
                        channel = %message.channel,
                        error = %err,
                        "dropping malformed membership event"
                    );
                    return;
                }
            };
            let handler = handlers.lock().membership.clone();
            if let Some(handler) = handler {
                handler(event);
            }
        });

        let handlers = Arc::clone(&self.handlers);
        let signal_task = spawn_forwarder(signal_rx, SIGNAL_EVENT, move |message| {
            let decoded = std::str::from_utf8(&message.payload)
                .map_err(|err| signaling::CodecError::MalformedEnvelope(err.to_string()))
                .and_then(signaling::decode);
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(
                        target = "relay",
                        channel = %message.channel,
                        error = %err,
                        "dropping undecodable envelope"
                    );
                    return;
                }
            };
            tracing::trace!(target = "relay", %envelope, "envelope received");
            let handler = handlers.lock().signal.clone();
            if let Some(handler) = handler {
                handler(envelope);
            }
        });

        tracing::debug!(
            target = "relay",
            room_topic,
            global_topic,
            "relay subscriptions active"
        );
        *self.active.lock() = Some(Subscription {
            room_topic: room_topic.to_string(),
            global_topic: global_topic.to_string(),
            tasks: vec![membership_task, signal_task],
        });
    }

    /// Drops both subscriptions. Safe to call when not joined.
    pub fn leave(&self) {
        let Some(subscription) = self.active.lock().take() else {
            return;
        };
        for task in subscription.tasks {
            task.abort();
        }
        self.bus.unsubscribe(&subscription.room_topic);
        if subscription.global_topic != subscription.room_topic {
            self.bus.unsubscribe(&subscription.global_topic);
        }
        tracing::debug!(
            target = "relay",
            room_topic = %subscription.room_topic,
            "relay subscriptions released"
        );
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.leave();
    }
}

fn spawn_forwarder<F>(
    mut rx: broadcast::Receiver<RelayMessage>,
    event: &'static str,
    deliver: F,
) -> JoinHandle<()>
where
    F: Fn(&RelayMessage) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) if message.event == event => deliver(&message),
                Ok(message) => {
                    tracing::trace!(
                        target = "relay",
                        channel = %message.channel,
                        event = %message.event,
                        "ignoring unrelated relay event"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "relay", skipped, "relay subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
