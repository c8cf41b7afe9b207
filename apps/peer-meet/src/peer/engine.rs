use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::{
    ConnectionStatus, IceCandidate, LocalTrack, PeerConnection, PeerError, PeerEvent,
    PeerEventHandler, RemoteTrack, SdpKind, SessionDescription, TrackKind,
};

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

impl PeerConfig {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

/// [`PeerConnection`] backed by a `webrtc` crate peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: AsyncMutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    pub async fn new(config: &PeerConfig) -> Result<Self, PeerError> {
        let api = build_api(SettingEngine::default())?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(to_engine_error)?;
        tracing::debug!(
            target = "webrtc",
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );
        Ok(Self {
            pc: Arc::new(pc),
            senders: AsyncMutex::new(HashMap::new()),
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_engine_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_engine_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_engine_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::Engine(err.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::InvalidDescription(format!(
            "engine produced unexpected description type {other}"
        ))),
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn connection_status(state: RTCPeerConnectionState) -> ConnectionStatus {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionStatus::Connecting,
        RTCPeerConnectionState::Connected => ConnectionStatus::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionStatus::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionStatus::Failed,
        RTCPeerConnectionState::Closed => ConnectionStatus::Closed,
        _ => ConnectionStatus::New,
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_engine_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(to_engine_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(to_engine_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(to_engine_error)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_engine_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_engine_error)
    }

    async fn add_track(&self, stream_id: &str, track: &LocalTrack) -> Result<(), PeerError> {
        let mut senders = self.senders.lock().await;
        if senders.contains_key(&track.id) {
            return Ok(());
        }
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id.to_string(),
        ));
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_engine_error)?;
        tracing::debug!(
            target = "webrtc",
            track_id = %track.id,
            kind = %track.kind,
            stream_id,
            "local track added"
        );
        senders.insert(track.id.clone(), sender);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(to_engine_error)
    }

    fn on_event(&self, handler: PeerEventHandler) {
        let negotiation = Arc::clone(&handler);
        self.pc.on_negotiation_needed(Box::new(move || {
            let handler = Arc::clone(&negotiation);
            Box::pin(async move {
                handler(PeerEvent::NegotiationNeeded);
            })
        }));

        let candidates = Arc::clone(&handler);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let handler = Arc::clone(&candidates);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "webrtc", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => handler(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "unable to serialize local candidate");
                    }
                }
            })
        }));

        let tracks = Arc::clone(&handler);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let handler = Arc::clone(&tracks);
            Box::pin(async move {
                let Some(kind) = track_kind(track.kind()) else {
                    tracing::debug!(target = "webrtc", "ignoring remote track of unknown kind");
                    return;
                };
                handler(PeerEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
            })
        }));

        let states = handler;
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let handler = Arc::clone(&states);
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                    handler(PeerEvent::ConnectionState(connection_status(state)));
                })
            }));
    }
}
