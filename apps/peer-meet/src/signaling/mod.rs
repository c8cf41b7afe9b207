//! Signaling envelopes exchanged over the relay.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::{IceCandidate, SessionDescription};

pub mod codec;

pub use codec::{
    CodecError, decode, decode_payload, encode, encode_payload, BROADCAST_MARKER, SUCCESS_TEXT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Success,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Success => "success",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressee of an envelope: one participant or everyone listening.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Peer(String),
    All,
}

impl Recipient {
    pub fn peer(identity: impl Into<String>) -> Self {
        Recipient::Peer(identity.into())
    }

    pub fn includes(&self, identity: &str) -> bool {
        match self {
            Recipient::All => true,
            Recipient::Peer(peer) => peer == identity,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::All => BROADCAST_MARKER,
            Recipient::Peer(peer) => peer,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Success(String),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
            SignalPayload::Success(_) => SignalKind::Success,
        }
    }
}

/// One signaling message as carried on the global topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub room: String,
    pub from: String,
    pub to: Recipient,
    pub payload: SignalPayload,
}

impl Envelope {
    pub fn new(
        room: impl Into<String>,
        from: impl Into<String>,
        to: Recipient,
        payload: SignalPayload,
    ) -> Self {
        Self {
            room: room.into(),
            from: from.into(),
            to,
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} room={} from={} to={}",
            self.kind(),
            self.room,
            self.from,
            self.to
        )
    }
}
