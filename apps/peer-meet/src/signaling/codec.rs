use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Envelope, Recipient, SignalKind, SignalPayload};
use crate::peer::{IceCandidate, SdpKind, SessionDescription};

/// Value of `to` that addresses every participant.
pub const BROADCAST_MARKER: &str = "all";

/// Status text carried by the `success` envelope after an answer is applied.
pub const SUCCESS_TEXT: &str = "Call Accepted";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedEnvelope(reason.into())
}

/// Flat wire form shared by the relay topic and the HTTP relay trigger.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    pub room: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
}

impl WireEnvelope {
    pub(crate) fn from_envelope(envelope: &Envelope) -> Result<Self, CodecError> {
        if matches!(&envelope.to, Recipient::Peer(peer) if peer == BROADCAST_MARKER) {
            return Err(malformed(format!(
                "{BROADCAST_MARKER:?} is reserved for broadcast and cannot name a peer"
            )));
        }
        let (kind, data) = encode_payload(&envelope.payload)?;
        Ok(Self {
            room: envelope.room.clone(),
            from: envelope.from.clone(),
            to: envelope.to.as_str().to_string(),
            kind,
            data,
        })
    }

    pub(crate) fn into_envelope(self) -> Result<Envelope, CodecError> {
        if self.room.is_empty() {
            return Err(malformed("room is empty"));
        }
        if self.from.is_empty() {
            return Err(malformed("sender is empty"));
        }
        let to = match self.to.as_str() {
            "" => return Err(malformed("recipient is empty")),
            BROADCAST_MARKER => Recipient::All,
            peer => Recipient::peer(peer),
        };
        let payload = decode_payload(self.kind, &self.data)?;
        Ok(Envelope {
            room: self.room,
            from: self.from,
            to,
            payload,
        })
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let wire = WireEnvelope::from_envelope(envelope)?;
    serde_json::to_string(&wire).map_err(|err| malformed(err.to_string()))
}

pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let wire: WireEnvelope =
        serde_json::from_str(text).map_err(|err| malformed(err.to_string()))?;
    wire.into_envelope()
}

pub fn encode_payload(payload: &SignalPayload) -> Result<(SignalKind, String), CodecError> {
    let data = match payload {
        SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_string(desc),
        SignalPayload::Candidate(candidate) => serde_json::to_string(candidate),
        SignalPayload::Success(text) => Ok(text.clone()),
    }
    .map_err(|err| malformed(err.to_string()))?;
    Ok((payload.kind(), data))
}

pub fn decode_payload(kind: SignalKind, data: &str) -> Result<SignalPayload, CodecError> {
    match kind {
        SignalKind::Offer => decode_description(data, SdpKind::Offer).map(SignalPayload::Offer),
        SignalKind::Answer => decode_description(data, SdpKind::Answer).map(SignalPayload::Answer),
        SignalKind::Candidate => {
            let candidate: IceCandidate = serde_json::from_str(data)
                .map_err(|err| malformed(format!("candidate payload: {err}")))?;
            if candidate.candidate.is_empty() {
                return Err(malformed("candidate payload has no candidate line"));
            }
            Ok(SignalPayload::Candidate(candidate))
        }
        SignalKind::Success => Ok(SignalPayload::Success(data.to_string())),
    }
}

fn decode_description(data: &str, expected: SdpKind) -> Result<SessionDescription, CodecError> {
    let desc: SessionDescription = serde_json::from_str(data)
        .map_err(|err| malformed(format!("session description payload: {err}")))?;
    if desc.kind != expected {
        return Err(malformed(format!(
            "expected {expected:?} description, found {:?}",
            desc.kind
        )));
    }
    if desc.sdp.is_empty() {
        return Err(malformed("session description has empty sdp"));
    }
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_envelope() -> Envelope {
        Envelope::new(
            "42",
            "alice",
            Recipient::peer("bob"),
            SignalPayload::Offer(SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n")),
        )
    }

    #[test]
    fn envelope_survives_encoding() {
        let original = offer_envelope();
        let text = encode(&original).unwrap();
        assert_eq!(decode(&text).unwrap(), original);
    }

    #[test]
    fn peer_named_like_the_broadcast_marker_cannot_be_encoded() {
        let mut envelope = offer_envelope();
        envelope.to = Recipient::peer(BROADCAST_MARKER);
        assert!(matches!(
            encode(&envelope),
            Err(CodecError::MalformedEnvelope(_))
        ));

        envelope.to = Recipient::All;
        let text = encode(&envelope).unwrap();
        assert_eq!(decode(&text).unwrap(), envelope);
    }

    #[test]
    fn wire_form_is_flat_with_stringified_data() {
        let text = encode(&offer_envelope()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["room"], "42");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["type"], "offer");
        let data: serde_json::Value =
            serde_json::from_str(value["data"].as_str().expect("data is a string")).unwrap();
        assert_eq!(data["type"], "offer");
    }

    #[test]
    fn browser_success_broadcast_decodes() {
        let text = json!({
            "room": "42",
            "from": "alice",
            "to": "all",
            "type": "success",
            "data": "Call Accepted",
        })
        .to_string();
        let envelope = decode(&text).unwrap();
        assert_eq!(envelope.to, Recipient::All);
        assert_eq!(envelope.payload, SignalPayload::Success(SUCCESS_TEXT.into()));
    }

    #[test]
    fn browser_candidate_decodes_with_camel_case_fields() {
        let data = json!({
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })
        .to_string();
        let payload = decode_payload(SignalKind::Candidate, &data).unwrap();
        match payload {
            SignalPayload::Candidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn non_json_input_is_malformed() {
        assert!(matches!(
            decode("not an envelope"),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let text = json!({
            "room": "42", "from": "alice", "to": "bob", "type": "hangup", "data": ""
        })
        .to_string();
        assert!(matches!(decode(&text), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn missing_field_is_malformed() {
        let text = json!({ "room": "42", "from": "alice", "type": "success", "data": "" })
            .to_string();
        assert!(matches!(decode(&text), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn offer_carrying_an_answer_is_malformed() {
        let data = serde_json::to_string(&SessionDescription::answer("v=0")).unwrap();
        assert!(matches!(
            decode_payload(SignalKind::Offer, &data),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn offer_with_garbage_data_is_malformed() {
        assert!(matches!(
            decode_payload(SignalKind::Offer, "{\"sdp\":"),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn empty_sender_is_malformed() {
        let text = json!({
            "room": "42", "from": "", "to": "all", "type": "success", "data": "ok"
        })
        .to_string();
        assert!(matches!(decode(&text), Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn candidate_without_line_is_malformed() {
        assert!(matches!(
            decode_payload(SignalKind::Candidate, "{\"candidate\":\"\"}"),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }
}
