//! Subscriber side of the Pusher channels protocol (version 7).
//!
//! Only what a browser client does is implemented: connect, subscribe to
//! public channels, answer pings and fan received channel events out to local
//! subscribers. Publishing happens server-side through the HTTP relay
//! trigger, so [`Bus::publish`] is rejected here.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use relay_bus::{Bus, BusError, BusResult, RelayMessage};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const PROTOCOL_VERSION: u8 = 7;
const CHANNEL_CAPACITY: usize = 256;
const CLIENT_NAME: &str = "peer-meet";

#[derive(Debug, Clone)]
pub struct PusherConfig {
    pub key: String,
    pub cluster: String,
    /// Overrides the cluster-derived websocket host, mostly for self-hosted
    /// Pusher-compatible servers.
    pub endpoint: Option<Url>,
}

impl PusherConfig {
    pub fn new(key: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cluster: cluster.into(),
            endpoint: None,
        }
    }

    pub fn socket_url(&self) -> BusResult<Url> {
        if self.key.trim().is_empty() {
            return Err(BusError::Transport("pusher app key is empty".into()));
        }
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(&format!("wss://ws-{}.pusher.com", self.cluster))
                .map_err(|err| BusError::Transport(format!("invalid pusher cluster: {err}")))?,
        };
        let mut url = base
            .join(&format!("app/{}", self.key))
            .map_err(|err| BusError::Transport(format!("invalid pusher url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"));
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
    socket_id: String,
}

struct Shared {
    outbound: mpsc::UnboundedSender<String>,
    channels: RwLock<HashMap<String, broadcast::Sender<RelayMessage>>>,
    socket_id: RwLock<Option<String>>,
}

impl Shared {
    fn send_frame(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        if self.outbound.send(frame).is_err() {
            tracing::debug!(target = "relay", event, "pusher socket writer is gone");
        }
    }

    /// Applies one inbound frame. Returns the socket id once the connection is
    /// established.
    fn handle_text(&self, text: &str) -> Option<String> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target = "relay", error = %err, "dropping unparseable pusher frame");
                return None;
            }
        };
        match frame.event.as_str() {
            "pusher:connection_established" => {
                let parsed = data_text(&frame.data)
                    .and_then(|raw| serde_json::from_str::<ConnectionEstablished>(&raw).ok());
                match parsed {
                    Some(established) => {
                        tracing::debug!(
                            target = "relay",
                            socket_id = %established.socket_id,
                            "pusher connection established"
                        );
                        *self.socket_id.write() = Some(established.socket_id.clone());
                        return Some(established.socket_id);
                    }
                    None => {
                        tracing::warn!(target = "relay", "pusher handshake without socket id");
                    }
                }
            }
            "pusher:ping" => self.send_frame("pusher:pong", json!({})),
            "pusher:pong" => {}
            "pusher:error" => {
                tracing::warn!(target = "relay", data = %frame.data, "pusher reported an error");
            }
            "pusher_internal:subscription_succeeded" => {
                tracing::debug!(
                    target = "relay",
                    channel = frame.channel.as_deref().unwrap_or(""),
                    "pusher subscription confirmed"
                );
            }
            event => {
                let Some(channel) = frame.channel else {
                    tracing::trace!(target = "relay", event, "pusher frame without channel");
                    return None;
                };
                let sender = self.channels.read().get(&channel).cloned();
                let Some(sender) = sender else {
                    tracing::trace!(target = "relay", %channel, event, "event for unsubscribed channel");
                    return None;
                };
                let payload = Bytes::from(data_text(&frame.data).unwrap_or_default());
                let _ = sender.send(RelayMessage {
                    channel,
                    event: event.to_string(),
                    payload,
                });
            }
        }
        None
    }
}

/// Channel event data arrives either as a JSON-encoded string or inline.
fn data_text(data: &Value) -> Option<String> {
    match data {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// [`Bus`] backed by a Pusher websocket connection.
pub struct PusherBus {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PusherBus {
    /// Opens the socket and waits for the connection handshake.
    pub async fn connect(config: &PusherConfig) -> BusResult<Self> {
        let url = config.socket_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| BusError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", cluster = %config.cluster, "pusher websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared {
            outbound,
            channels: RwLock::new(HashMap::new()),
            socket_id: RwLock::new(None),
        });

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target = "relay", error = %err, "pusher websocket error");
                        break;
                    }
                };
                if reader_shared.handle_text(&text).is_some() {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
            }
            tracing::debug!(target = "relay", "pusher websocket closed");
            // Dropping the senders ends every local subscription.
            reader_shared.channels.write().clear();
        });

        let bus = Self {
            shared,
            tasks: Mutex::new(vec![writer, reader]),
        };
        ready_rx
            .await
            .map_err(|_| BusError::Transport("pusher closed before handshake".into()))?;
        Ok(bus)
    }

    pub fn socket_id(&self) -> Option<String> {
        self.shared.socket_id.read().clone()
    }
}

impl Bus for PusherBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage> {
        let mut channels = self.shared.channels.write();
        if let Some(sender) = channels.get(channel) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(channel.to_string(), sender);
        drop(channels);
        self.shared
            .send_frame("pusher:subscribe", json!({ "channel": channel }));
        receiver
    }

    fn publish(&self, _channel: &str, _event: &str, _payload: Bytes) -> BusResult<usize> {
        Err(BusError::PublishUnsupported)
    }

    fn unsubscribe(&self, channel: &str) {
        if self.shared.channels.write().remove(channel).is_some() {
            self.shared
                .send_frame("pusher:unsubscribe", json!({ "channel": channel }));
        }
    }
}

impl Drop for PusherBus {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            channels: RwLock::new(HashMap::new()),
            socket_id: RwLock::new(None),
        });
        (shared, rx)
    }

    #[test]
    fn socket_url_uses_cluster_and_protocol() {
        let url = PusherConfig::new("abc123", "ap2").socket_url().unwrap();
        assert_eq!(url.host_str(), Some("ws-ap2.pusher.com"));
        assert_eq!(url.path(), "/app/abc123");
        assert!(url.query().unwrap().contains("protocol=7"));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(PusherConfig::new(" ", "ap2").socket_url().is_err());
    }

    #[test]
    fn handshake_records_socket_id() {
        let (shared, _rx) = shared();
        let frame = json!({
            "event": "pusher:connection_established",
            "data": "{\"socket_id\":\"123.456\",\"activity_timeout\":120}",
        });
        let socket_id = shared.handle_text(&frame.to_string());
        assert_eq!(socket_id.as_deref(), Some("123.456"));
        assert_eq!(shared.socket_id.read().as_deref(), Some("123.456"));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (shared, mut rx) = shared();
        shared.handle_text(r#"{"event":"pusher:ping","data":{}}"#);
        let reply: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["event"], "pusher:pong");
    }

    #[test]
    fn channel_events_reach_local_subscribers() {
        let (shared, _rx) = shared();
        let (sender, mut receiver) = broadcast::channel(4);
        shared.channels.write().insert("chat-42".into(), sender);

        let frame = json!({
            "event": "user-joined",
            "channel": "chat-42",
            "data": "{\"room\":\"42\",\"newUsername\":\"bob\"}",
        });
        shared.handle_text(&frame.to_string());

        let message = receiver.try_recv().unwrap();
        assert_eq!(message.event, "user-joined");
        assert_eq!(
            message.payload,
            Bytes::from_static(br#"{"room":"42","newUsername":"bob"}"#)
        );
    }

    #[test]
    fn inline_object_data_is_serialized() {
        let (shared, _rx) = shared();
        let (sender, mut receiver) = broadcast::channel(4);
        shared.channels.write().insert("web".into(), sender);

        shared.handle_text(r#"{"event":"message","channel":"web","data":{"room":"42"}}"#);
        let message = receiver.try_recv().unwrap();
        assert_eq!(message.payload, Bytes::from_static(br#"{"room":"42"}"#));
    }

    #[test]
    fn garbage_frames_are_ignored() {
        let (shared, mut rx) = shared();
        assert!(shared.handle_text("not json").is_none());
        assert!(rx.try_recv().is_err());
    }
}
