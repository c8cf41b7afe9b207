use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_bus::{Bus, BusError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::relay::{GLOBAL_TOPIC, MEMBERSHIP_EVENT, MembershipEvent, SIGNAL_EVENT, room_topic};
use crate::signaling::codec::WireEnvelope;
use crate::signaling::{CodecError, Envelope};

/// Status value the room server reports for an accepted request.
pub const STATUS_OK: u16 = 200;

/// Body returned by both room server endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAck {
    pub status: u16,
    #[serde(default)]
    pub message: String,
}

impl RoomAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomServiceError {
    #[error("room server unreachable: {0}")]
    NetworkFailure(String),
    #[error("room server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid room service configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<reqwest::Error> for RoomServiceError {
    fn from(err: reqwest::Error) -> Self {
        RoomServiceError::NetworkFailure(err.to_string())
    }
}

/// Room registration plus the connect-relay trigger that republishes an
/// envelope on the global topic.
#[async_trait]
pub trait RoomService: Send + Sync {
    async fn register(&self, room: &str, username: &str) -> Result<RoomAck, RoomServiceError>;

    async fn relay(&self, envelope: &Envelope) -> Result<RoomAck, RoomServiceError>;
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    room: &'a str,
    #[serde(rename = "newUsername")]
    new_username: &'a str,
}

fn accept(ack: RoomAck) -> Result<RoomAck, RoomServiceError> {
    if ack.status == STATUS_OK {
        Ok(ack)
    } else {
        Err(RoomServiceError::Rejected {
            status: ack.status,
            message: ack.message,
        })
    }
}

pub struct HttpRoomService {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpRoomService {
    pub fn new(base_url: &str) -> Result<Self, RoomServiceError> {
        let mut base_url = Url::parse(base_url).map_err(|err| {
            RoomServiceError::InvalidConfig(format!("invalid server url {base_url}: {err}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, RoomServiceError> {
        self.base_url.join(path).map_err(|err| {
            RoomServiceError::InvalidConfig(format!("invalid endpoint {path}: {err}"))
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<RoomAck, RoomServiceError> {
        let endpoint = self.endpoint(path)?;
        let response = self.client.post(endpoint).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str::<RoomAck>(&text) {
            Ok(ack) => accept(ack),
            Err(_) if !status.is_success() => Err(RoomServiceError::Rejected {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            }),
            Err(err) => Err(RoomServiceError::NetworkFailure(format!(
                "invalid response from {path}: {err}"
            ))),
        }
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    async fn register(&self, room: &str, username: &str) -> Result<RoomAck, RoomServiceError> {
        tracing::debug!(target = "room", room, username, "registering with room server");
        self.post(
            "common/createroom",
            &RegisterRequest {
                room,
                new_username: username,
            },
        )
        .await
    }

    async fn relay(&self, envelope: &Envelope) -> Result<RoomAck, RoomServiceError> {
        let wire = WireEnvelope::from_envelope(envelope)?;
        tracing::debug!(target = "room", %envelope, "relaying envelope");
        self.post("webrtc/connect", &wire).await
    }
}

/// In-process stand-in for the room server that publishes straight onto a
/// [`Bus`].
pub struct LocalRoomService {
    bus: Arc<dyn Bus>,
    rooms: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl LocalRoomService {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RoomService for LocalRoomService {
    async fn register(&self, room: &str, username: &str) -> Result<RoomAck, RoomServiceError> {
        if room.trim().is_empty() || username.trim().is_empty() {
            return accept(RoomAck {
                status: 400,
                message: "room and username are required".into(),
            });
        }
        self.rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .insert(username.to_string());

        let event = MembershipEvent {
            room: room.to_string(),
            identity: username.to_string(),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|err| CodecError::MalformedEnvelope(err.to_string()))?;
        let reached = self
            .bus
            .publish(&room_topic(room), MEMBERSHIP_EVENT, Bytes::from(payload))?;
        tracing::debug!(target = "room", room, username, reached, "membership published");
        Ok(RoomAck::ok(format!("Joined room {room}")))
    }

    async fn relay(&self, envelope: &Envelope) -> Result<RoomAck, RoomServiceError> {
        let text = crate::signaling::encode(envelope)?;
        let reached = self
            .bus
            .publish(GLOBAL_TOPIC, SIGNAL_EVENT, Bytes::from(text))?;
        tracing::trace!(target = "room", %envelope, reached, "envelope published");
        Ok(RoomAck::ok(format!("{} sent to {}", envelope.kind(), envelope.to)))
    }
}
