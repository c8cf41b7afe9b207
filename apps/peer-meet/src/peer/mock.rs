use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    IceCandidate, LocalTrack, PeerConnection, PeerError, PeerEvent, PeerEventHandler, SdpKind,
    SessionDescription,
};

/// Calls recorded by [`MockPeer`], in the order they were made.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Rollback,
    AddCandidate(IceCandidate),
    AddTrack { stream_id: String, track_id: String },
    Close,
}

#[derive(Default)]
struct MockState {
    label: String,
    generated: u32,
    calls: Vec<PeerCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    fail_next: Option<&'static str>,
    negotiation_needed: bool,
    closed: bool,
    handler: Option<PeerEventHandler>,
}

/// Scripted stand-in for the media engine.
///
/// Descriptions are synthetic (`"{label}-offer-1"`, ...). Adding a new track
/// fires [`PeerEvent::NegotiationNeeded`] once until the next offer is
/// created, like a real engine coalesces the signal.
#[derive(Clone, Default)]
pub struct MockPeer {
    inner: Arc<Mutex<MockState>>,
}

impl MockPeer {
    pub fn new(label: impl Into<String>) -> Self {
        let peer = Self::default();
        peer.inner.lock().label = label.into();
        peer
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    pub fn remote_description_sets(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, PeerCall::SetRemote(_)))
            .count()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.inner.lock().tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Makes the next call to `operation` (e.g. `"create_answer"`) fail.
    pub fn fail_next(&self, operation: &'static str) {
        self.inner.lock().fail_next = Some(operation);
    }

    /// Delivers an engine event to the installed handler.
    pub fn emit(&self, event: PeerEvent) {
        let handler = self.inner.lock().handler.clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn enter(&self, operation: &'static str, call: PeerCall) -> Result<(), PeerError> {
        let mut state = self.inner.lock();
        state.calls.push(call);
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state.fail_next == Some(operation) {
            state.fail_next = None;
            return Err(PeerError::Engine(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn generate(&self, kind: SdpKind) -> SessionDescription {
        let mut state = self.inner.lock();
        state.generated += 1;
        let label = if state.label.is_empty() {
            "mock"
        } else {
            state.label.as_str()
        };
        let sdp = match kind {
            SdpKind::Offer => format!("{label}-offer-{}", state.generated),
            SdpKind::Answer => format!("{label}-answer-{}", state.generated),
        };
        SessionDescription { kind, sdp }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.enter("create_offer", PeerCall::CreateOffer)?;
        self.inner.lock().negotiation_needed = false;
        Ok(self.generate(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.enter("create_answer", PeerCall::CreateAnswer)?;
        let has_remote_offer = matches!(
            self.inner.lock().remote,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        );
        if !has_remote_offer {
            return Err(PeerError::Engine(
                "create_answer without a remote offer".into(),
            ));
        }
        Ok(self.generate(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.enter("set_local_description", PeerCall::SetLocal(desc.clone()))?;
        self.inner.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.enter("set_remote_description", PeerCall::SetRemote(desc.clone()))?;
        let mut state = self.inner.lock();
        if desc.kind == SdpKind::Answer
            && !matches!(
                state.local,
                Some(SessionDescription {
                    kind: SdpKind::Offer,
                    ..
                })
            )
        {
            return Err(PeerError::InvalidDescription(
                "answer applied without a local offer".into(),
            ));
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.enter("rollback", PeerCall::Rollback)?;
        let mut state = self.inner.lock();
        if matches!(
            state.local,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        ) {
            state.local = None;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.enter("add_ice_candidate", PeerCall::AddCandidate(candidate))?;
        if self.inner.lock().remote.is_none() {
            return Err(PeerError::Engine(
                "candidate added before remote description".into(),
            ));
        }
        Ok(())
    }

    async fn add_track(&self, stream_id: &str, track: &LocalTrack) -> Result<(), PeerError> {
        self.enter(
            "add_track",
            PeerCall::AddTrack {
                stream_id: stream_id.to_string(),
                track_id: track.id.clone(),
            },
        )?;
        let signal = {
            let mut state = self.inner.lock();
            if state.tracks.contains(&track.id) {
                false
            } else {
                state.tracks.push(track.id.clone());
                !std::mem::replace(&mut state.negotiation_needed, true)
            }
        };
        if signal {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.inner.lock();
        state.calls.push(PeerCall::Close);
        state.closed = true;
        Ok(())
    }

    fn on_event(&self, handler: PeerEventHandler) {
        self.inner.lock().handler = Some(handler);
    }
}
