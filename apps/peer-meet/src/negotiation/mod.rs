//! Offer/answer state machine for one local participant and one remote peer.
//!
//! The machine never talks to the relay itself: every operation returns an
//! [`Outcome`] and envelopes that must be published are handed back to the
//! caller. Incoming envelopes that are stale, duplicated, echoed or meant for
//! somebody else come back as [`Outcome::Ignored`]; those are routine on a
//! broadcast relay and are not errors.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::peer::{IceCandidate, PeerConnection, PeerError, SdpKind, SessionDescription};
use crate::signaling::{Envelope, Recipient, SUCCESS_TEXT, SignalKind, SignalPayload};

/// Remote candidates kept while no remote description has been applied.
const MAX_BUFFERED_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerExchanged => "answer-exchanged",
            NegotiationState::Connected => "connected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub room: String,
    pub identity: String,
}

/// Why an incoming envelope or engine signal produced no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    OtherRoom,
    SelfEcho,
    NotAddressed,
    UnknownPeer,
    Stale(NegotiationState),
    DuplicateOffer,
    /// Both sides offered; ours takes precedence and the remote side yields.
    GlareWon,
    /// Renegotiation was requested mid-round and will run once connected.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Envelopes to hand to the relay, in order.
    Publish(Vec<Envelope>),
    /// A `success` from the peer or our own echoed `success` was accepted.
    Accepted,
    /// A remote candidate was applied to the engine.
    Applied,
    /// A candidate was queued until the other half of the exchange exists.
    Buffered,
    Ignored(Ignored),
}

impl Outcome {
    pub fn envelopes(&self) -> &[Envelope] {
        match self {
            Outcome::Publish(envelopes) => envelopes,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("negotiation is not bound to a room and identity")]
    Unbound,
    #[error("{operation} is not valid while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("cannot negotiate with our own identity")]
    SelfTarget,
    #[error("expected a {expected} envelope, got {found}")]
    UnexpectedPayload {
        expected: SignalKind,
        found: SignalKind,
    },
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub struct Negotiator {
    peer: Arc<dyn PeerConnection>,
    local: Option<LocalEndpoint>,
    state: NegotiationState,
    role: Option<Role>,
    remote: Option<String>,
    established: bool,
    remote_description_applied: bool,
    last_remote_offer: Option<String>,
    renegotiation_pending: bool,
    inbound_candidates: Vec<(String, IceCandidate)>,
    outbound_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub fn new(peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer,
            local: None,
            state: NegotiationState::Idle,
            role: None,
            remote: None,
            established: false,
            remote_description_applied: false,
            last_remote_offer: None,
            renegotiation_pending: false,
            inbound_candidates: Vec::new(),
            outbound_candidates: Vec::new(),
        }
    }

    /// Starts a fresh negotiation context for `identity` in `room`.
    pub fn bind(&mut self, room: impl Into<String>, identity: impl Into<String>) {
        self.reset();
        self.local = Some(LocalEndpoint {
            room: room.into(),
            identity: identity.into(),
        });
    }

    pub fn unbind(&mut self) {
        self.reset();
        self.local = None;
    }

    /// Forgets the peer and every in-flight round. The engine is left as is.
    pub fn reset(&mut self) {
        if self.state != NegotiationState::Idle {
            tracing::debug!(target = "negotiation", state = %self.state, "negotiation reset");
        }
        self.state = NegotiationState::Idle;
        self.role = None;
        self.remote = None;
        self.established = false;
        self.remote_description_applied = false;
        self.last_remote_offer = None;
        self.renegotiation_pending = false;
        self.inbound_candidates.clear();
        self.outbound_candidates.clear();
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn local(&self) -> Option<&LocalEndpoint> {
        self.local.as_ref()
    }

    /// True once an offer/answer round has completed at least once.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// True when a deferred renegotiation should run now.
    pub fn renegotiation_due(&self) -> bool {
        self.renegotiation_pending && self.state == NegotiationState::Connected
    }

    pub async fn initiate(&mut self, peer_identity: &str) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        if peer_identity == local.identity {
            return Err(NegotiationError::SelfTarget);
        }
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidTransition {
                operation: "initiate",
                state: self.state,
            });
        }
        let outcome = self
            .send_offer(&local, peer_identity, NegotiationState::Idle)
            .await?;
        self.role = Some(Role::Initiator);
        Ok(outcome)
    }

    /// The engine asks for a fresh offer, typically because a track was added.
    pub async fn on_renegotiation_needed(&mut self) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        match self.state {
            NegotiationState::Connected => {}
            NegotiationState::Idle => {
                tracing::debug!(
                    target = "negotiation",
                    "renegotiation requested before any call; first offer will carry it"
                );
                return Ok(Outcome::Ignored(Ignored::Stale(NegotiationState::Idle)));
            }
            state => {
                tracing::debug!(target = "negotiation", %state, "renegotiation deferred");
                self.renegotiation_pending = true;
                return Ok(Outcome::Ignored(Ignored::Deferred));
            }
        }
        let Some(remote) = self.remote.clone() else {
            return Ok(Outcome::Ignored(Ignored::Stale(self.state)));
        };
        self.renegotiation_pending = false;
        tracing::info!(target = "negotiation", peer = %remote, "renegotiating");
        self.send_offer(&local, &remote, NegotiationState::Connected)
            .await
    }

    /// Runs a fresh offer round with the established peer. Used when the
    /// previous round completed locally but its `success` never reached
    /// the other side.
    pub async fn reoffer(&mut self) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        let remote = match (self.state, self.remote.clone()) {
            (NegotiationState::Connected, Some(remote)) => remote,
            (state, _) => {
                return Err(NegotiationError::InvalidTransition {
                    operation: "reoffer",
                    state,
                });
            }
        };
        self.renegotiation_pending = false;
        tracing::info!(target = "negotiation", peer = %remote, "offering again");
        self.send_offer(&local, &remote, NegotiationState::Connected)
            .await
    }

    /// Routes an incoming envelope to the matching handler.
    pub async fn dispatch(&mut self, envelope: &Envelope) -> Result<Outcome, NegotiationError> {
        match envelope.kind() {
            SignalKind::Offer => self.handle_incoming_offer(envelope).await,
            SignalKind::Answer => self.handle_incoming_answer(envelope).await,
            SignalKind::Candidate => self.handle_incoming_candidate(envelope).await,
            SignalKind::Success => self.handle_incoming_success(envelope),
        }
    }

    pub async fn handle_incoming_offer(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        if let Some(reason) = admit(&local, envelope, false) {
            return Ok(ignore(envelope, reason));
        }
        let SignalPayload::Offer(offer) = &envelope.payload else {
            return Err(unexpected(SignalKind::Offer, envelope));
        };
        let from = envelope.from.as_str();
        if self.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            return Ok(ignore(envelope, Ignored::DuplicateOffer));
        }

        let fallback = match self.state {
            NegotiationState::Idle => NegotiationState::Idle,
            NegotiationState::Connected | NegotiationState::AnswerExchanged => {
                if self.remote.as_deref() != Some(from) {
                    return Ok(ignore(envelope, Ignored::UnknownPeer));
                }
                self.state
            }
            NegotiationState::OfferSent => {
                if self.remote.as_deref() != Some(from) {
                    return Ok(ignore(envelope, Ignored::UnknownPeer));
                }
                if local.identity.as_str() < from {
                    return Ok(ignore(envelope, Ignored::GlareWon));
                }
                tracing::info!(
                    target = "negotiation",
                    peer = %from,
                    "offer collision; rolling back local offer"
                );
                self.peer.rollback().await?;
                if self.established {
                    // The rolled-back offer carried our renegotiation; offer
                    // again once the remote round completes.
                    self.renegotiation_pending = true;
                    NegotiationState::Connected
                } else {
                    NegotiationState::Idle
                }
            }
            NegotiationState::OfferReceived => {
                return Ok(ignore(envelope, Ignored::Stale(self.state)));
            }
        };

        self.transition(NegotiationState::OfferReceived);
        if let Err(err) = self.peer.set_remote_description(offer.clone()).await {
            self.transition(fallback);
            return Err(err.into());
        }
        self.remote_description_applied = true;
        self.remote = Some(from.to_string());
        self.flush_inbound_candidates(from).await;

        let answer = match self.create_local(SdpKind::Answer).await {
            Ok(answer) => answer,
            Err(err) => {
                self.transition(fallback);
                return Err(err.into());
            }
        };
        self.last_remote_offer = Some(offer.sdp.clone());
        if !self.established {
            self.role = Some(Role::Responder);
        }
        self.transition(NegotiationState::AnswerExchanged);

        let mut outbound = vec![Envelope::new(
            local.room.clone(),
            local.identity.clone(),
            Recipient::peer(from),
            SignalPayload::Answer(answer),
        )];
        outbound.extend(self.drain_outbound_candidates(&local, from));
        Ok(Outcome::Publish(outbound))
    }

    pub async fn handle_incoming_answer(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        if let Some(reason) = admit(&local, envelope, false) {
            return Ok(ignore(envelope, reason));
        }
        let SignalPayload::Answer(answer) = &envelope.payload else {
            return Err(unexpected(SignalKind::Answer, envelope));
        };
        if self.state != NegotiationState::OfferSent {
            return Ok(ignore(envelope, Ignored::Stale(self.state)));
        }
        let from = envelope.from.as_str();
        if self.remote.as_deref() != Some(from) {
            return Ok(ignore(envelope, Ignored::UnknownPeer));
        }

        self.peer.set_remote_description(answer.clone()).await?;
        self.remote_description_applied = true;
        self.flush_inbound_candidates(from).await;
        self.established = true;
        self.transition(NegotiationState::Connected);

        Ok(Outcome::Publish(vec![Envelope::new(
            local.room,
            local.identity,
            Recipient::All,
            SignalPayload::Success(SUCCESS_TEXT.to_string()),
        )]))
    }

    /// Our own echoed `success` is the acknowledgement of the broadcast we
    /// sent, so unlike the other kinds it is not filtered as self-echo. It
    /// never moves the state machine though.
    pub fn handle_incoming_success(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        if let Some(reason) = admit(&local, envelope, true) {
            return Ok(ignore(envelope, reason));
        }
        if !matches!(envelope.payload, SignalPayload::Success(_)) {
            return Err(unexpected(SignalKind::Success, envelope));
        }
        if envelope.from == local.identity {
            return Ok(Outcome::Accepted);
        }
        if self.remote.as_deref() != Some(envelope.from.as_str()) {
            return Ok(ignore(envelope, Ignored::UnknownPeer));
        }
        if self.state == NegotiationState::AnswerExchanged {
            self.established = true;
            self.transition(NegotiationState::Connected);
        }
        Ok(Outcome::Accepted)
    }

    pub async fn handle_incoming_candidate(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        if let Some(reason) = admit(&local, envelope, false) {
            return Ok(ignore(envelope, reason));
        }
        let SignalPayload::Candidate(candidate) = &envelope.payload else {
            return Err(unexpected(SignalKind::Candidate, envelope));
        };
        let from = envelope.from.as_str();
        match self.remote.as_deref() {
            Some(remote) if remote != from => Ok(ignore(envelope, Ignored::UnknownPeer)),
            Some(_) if self.remote_description_applied => {
                self.peer.add_ice_candidate(candidate.clone()).await?;
                Ok(Outcome::Applied)
            }
            _ => {
                if self.inbound_candidates.len() >= MAX_BUFFERED_CANDIDATES {
                    self.inbound_candidates.remove(0);
                }
                self.inbound_candidates
                    .push((from.to_string(), candidate.clone()));
                Ok(Outcome::Buffered)
            }
        }
    }

    /// A candidate gathered by the local engine.
    pub fn local_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<Outcome, NegotiationError> {
        let local = self.endpoint()?;
        match self.remote.clone() {
            Some(remote) => Ok(Outcome::Publish(vec![Envelope::new(
                local.room,
                local.identity,
                Recipient::peer(remote),
                SignalPayload::Candidate(candidate),
            )])),
            None => {
                self.outbound_candidates.push(candidate);
                Ok(Outcome::Buffered)
            }
        }
    }

    /// Abandons a round that never completed so a new call can start.
    pub async fn retract(&mut self) -> Result<(), NegotiationError> {
        let settled = if self.established {
            NegotiationState::Connected
        } else {
            NegotiationState::Idle
        };
        match self.state {
            NegotiationState::OfferSent => {
                self.peer.rollback().await?;
                self.transition(settled);
            }
            NegotiationState::AnswerExchanged | NegotiationState::OfferReceived => {
                self.transition(settled);
            }
            NegotiationState::Idle | NegotiationState::Connected => {}
        }
        if !self.established {
            self.remote = None;
            self.role = None;
        }
        Ok(())
    }

    fn endpoint(&self) -> Result<LocalEndpoint, NegotiationError> {
        self.local.clone().ok_or(NegotiationError::Unbound)
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            tracing::info!(
                target = "negotiation",
                from = %self.state,
                to = %next,
                peer = self.remote.as_deref().unwrap_or(""),
                "negotiation state changed"
            );
            self.state = next;
        }
    }

    async fn send_offer(
        &mut self,
        local: &LocalEndpoint,
        to: &str,
        fallback: NegotiationState,
    ) -> Result<Outcome, NegotiationError> {
        self.transition(NegotiationState::OfferSent);
        let offer = match self.create_local(SdpKind::Offer).await {
            Ok(offer) => offer,
            Err(err) => {
                self.transition(fallback);
                return Err(err.into());
            }
        };
        self.remote = Some(to.to_string());
        let mut outbound = vec![Envelope::new(
            local.room.clone(),
            local.identity.clone(),
            Recipient::peer(to),
            SignalPayload::Offer(offer),
        )];
        outbound.extend(self.drain_outbound_candidates(local, to));
        Ok(Outcome::Publish(outbound))
    }

    async fn create_local(&self, kind: SdpKind) -> Result<SessionDescription, PeerError> {
        let desc = match kind {
            SdpKind::Offer => self.peer.create_offer().await?,
            SdpKind::Answer => self.peer.create_answer().await?,
        };
        self.peer.set_local_description(desc.clone()).await?;
        Ok(desc)
    }

    async fn flush_inbound_candidates(&mut self, from: &str) {
        if self.inbound_candidates.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.inbound_candidates);
        for (sender, candidate) in buffered {
            if sender != from {
                tracing::debug!(
                    target = "negotiation",
                    sender = %sender,
                    "dropping buffered candidate from non-peer"
                );
                continue;
            }
            if let Err(err) = self.peer.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target = "negotiation",
                    peer = %from,
                    error = %err,
                    "failed to apply buffered candidate"
                );
            }
        }
    }

    fn drain_outbound_candidates(&mut self, local: &LocalEndpoint, to: &str) -> Vec<Envelope> {
        self.outbound_candidates
            .drain(..)
            .map(|candidate| {
                Envelope::new(
                    local.room.clone(),
                    local.identity.clone(),
                    Recipient::peer(to),
                    SignalPayload::Candidate(candidate),
                )
            })
            .collect()
    }
}

/// Common filters applied before any handler looks at an envelope.
fn admit(local: &LocalEndpoint, envelope: &Envelope, allow_self: bool) -> Option<Ignored> {
    if envelope.room != local.room {
        return Some(Ignored::OtherRoom);
    }
    if !allow_self && envelope.from == local.identity {
        return Some(Ignored::SelfEcho);
    }
    if !envelope.to.includes(&local.identity) {
        return Some(Ignored::NotAddressed);
    }
    None
}

fn ignore(envelope: &Envelope, reason: Ignored) -> Outcome {
    tracing::debug!(
        target = "negotiation",
        kind = %envelope.kind(),
        from = %envelope.from,
        to = %envelope.to,
        ?reason,
        "envelope ignored"
    );
    Outcome::Ignored(reason)
}

fn unexpected(expected: SignalKind, envelope: &Envelope) -> NegotiationError {
    NegotiationError::UnexpectedPayload {
        expected,
        found: envelope.kind(),
    }
}
