//! Session coordinator: owns the relay client, the negotiation state machine
//! and the peer connection, and applies every input one event at a time.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use relay_bus::Bus;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::media::{LocalMedia, MediaError, MediaSource, RemoteMedia};
use crate::negotiation::{
    LocalEndpoint, NegotiationError, NegotiationState, Negotiator, Outcome, Role,
};
use crate::peer::{ConnectionStatus, PeerConnection, PeerError, PeerEvent, RemoteTrack};
use crate::relay::{GLOBAL_TOPIC, MembershipEvent, RelayClient, room_topic};
use crate::signaling::{BROADCAST_MARKER, Envelope, SignalKind};

pub mod room;

pub use room::{HttpRoomService, LocalRoomService, RoomAck, RoomService, RoomServiceError};

const NOTICE_CAPACITY: usize = 64;

/// Every input the coordinator reacts to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Membership(MembershipEvent),
    Signal(Envelope),
    Peer(PeerEvent),
}

/// Short user-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    JoinedRoom { room: String },
    PeerJoined { identity: String },
    RelayAccepted { message: String },
    RelayRejected { reason: String },
    CallAccepted,
    StreamsSent { tracks: usize },
    RemoteTrack { kind: String },
    Failure { reason: String },
}

/// Observable state of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub room: Option<String>,
    pub identity: Option<String>,
    pub joined: bool,
    pub peer: Option<String>,
    pub role: Option<Role>,
    pub negotiation: NegotiationState,
    pub call_active: bool,
    pub local_stream: Option<String>,
    pub remote_stream: Option<String>,
    pub connection: ConnectionStatus,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} must not be empty")]
    InvalidInput(&'static str),
    #[error("identity {0:?} is reserved for broadcast")]
    ReservedIdentity(String),
    #[error("not joined to a room")]
    NotJoined,
    #[error("no peer has joined the room yet")]
    NoPeer,
    #[error("a call is already active")]
    CallActive,
    #[error("no call is active")]
    CallInactive,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Room(#[from] RoomServiceError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub struct SessionCoordinator {
    peer: Arc<dyn PeerConnection>,
    rooms: Arc<dyn RoomService>,
    relay: RelayClient,
    media: Arc<dyn MediaSource>,
    negotiator: Negotiator,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    joined: Option<LocalEndpoint>,
    remote_peer: Option<String>,
    call_active: bool,
    local_media: Option<LocalMedia>,
    attached_tracks: HashSet<String>,
    remote_media: Option<RemoteMedia>,
    connection: ConnectionStatus,
    notices: broadcast::Sender<Notice>,
    snapshot: watch::Sender<SessionSnapshot>,
    closed: bool,
}

impl SessionCoordinator {
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        rooms: Arc<dyn RoomService>,
        bus: Arc<dyn Bus>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let relay = RelayClient::new(bus);
        let membership_tx = events_tx.clone();
        relay.on_membership(Arc::new(move |event| {
            let _ = membership_tx.send(SessionEvent::Membership(event));
        }));
        let signal_tx = events_tx.clone();
        relay.on_signal(Arc::new(move |envelope| {
            let _ = signal_tx.send(SessionEvent::Signal(envelope));
        }));

        let peer_tx = events_tx.clone();
        peer.on_event(Arc::new(move |event| {
            let _ = peer_tx.send(SessionEvent::Peer(event));
        }));

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        Self {
            negotiator: Negotiator::new(Arc::clone(&peer)),
            peer,
            rooms,
            relay,
            media,
            events_tx,
            events_rx,
            joined: None,
            remote_peer: None,
            call_active: false,
            local_media: None,
            attached_tracks: HashSet::new(),
            remote_media: None,
            connection: ConnectionStatus::New,
            notices,
            snapshot,
            closed: false,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Sender for injecting events from outside the relay and the engine.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn call_active(&self) -> bool {
        self.call_active
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    pub async fn join_room(&mut self, room: &str, identity: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let room = room.trim();
        let identity = identity.trim();
        if room.is_empty() {
            return Err(SessionError::InvalidInput("room"));
        }
        if identity.is_empty() {
            return Err(SessionError::InvalidInput("identity"));
        }
        if identity == BROADCAST_MARKER {
            return Err(SessionError::ReservedIdentity(identity.to_string()));
        }
        if let Some(current) = &self.joined {
            if current.room == room && current.identity == identity {
                return Ok(());
            }
            self.teardown();
        }

        let ack = match self.rooms.register(room, identity).await {
            Ok(ack) => ack,
            Err(err) => {
                tracing::warn!(target = "session", room, identity, error = %err, "room registration failed");
                self.notify(Notice::Failure {
                    reason: err.to_string(),
                });
                return Err(err.into());
            }
        };

        self.negotiator.bind(room, identity);
        self.joined = Some(LocalEndpoint {
            room: room.to_string(),
            identity: identity.to_string(),
        });
        self.relay.join(&room_topic(room), GLOBAL_TOPIC);
        tracing::info!(target = "session", room, identity, message = %ack.message, "joined room");
        self.notify(Notice::JoinedRoom {
            room: room.to_string(),
        });
        self.publish_snapshot();
        Ok(())
    }

    /// Records a newly announced participant as the call target.
    pub fn on_peer_joined(&mut self, identity: &str) {
        let Some(local) = &self.joined else {
            return;
        };
        if identity == local.identity {
            return;
        }
        if self.call_active {
            tracing::debug!(target = "session", identity, "ignoring arrival during active call");
            return;
        }
        tracing::info!(target = "session", identity, "peer joined");
        self.remote_peer = Some(identity.to_string());
        self.notify(Notice::PeerJoined {
            identity: identity.to_string(),
        });
        self.publish_snapshot();
    }

    /// Calls the recorded peer. Calling again recovers a round that stalled
    /// because an envelope was lost on the relay.
    pub async fn start_call(&mut self) -> Result<(), SessionError> {
        if self.joined.is_none() {
            return Err(SessionError::NotJoined);
        }
        if self.call_active {
            return self.resume_active_call().await;
        }
        let target = self.remote_peer.clone().ok_or(SessionError::NoPeer)?;
        self.retract_stalled().await?;
        let outcome = if self.negotiator.state() == NegotiationState::Connected {
            if self.negotiator.remote_peer() == Some(target.as_str()) {
                // Our round completed but the peer never saw the success.
                self.negotiator.reoffer().await?
            } else {
                self.negotiator.reset();
                self.negotiator.initiate(&target).await?
            }
        } else {
            self.negotiator.initiate(&target).await?
        };
        self.publish(outcome).await;
        self.publish_snapshot();
        Ok(())
    }

    /// During a call only a stalled renegotiation can be retried; the call
    /// itself stays active.
    async fn resume_active_call(&mut self) -> Result<(), SessionError> {
        if self.negotiator.state() == NegotiationState::Connected {
            return Err(SessionError::CallActive);
        }
        self.retract_stalled().await?;
        self.replay_renegotiation().await?;
        self.publish_snapshot();
        Ok(())
    }

    async fn retract_stalled(&mut self) -> Result<(), SessionError> {
        let state = self.negotiator.state();
        if matches!(state, NegotiationState::Idle | NegotiationState::Connected) {
            return Ok(());
        }
        tracing::info!(target = "session", %state, "retracting stalled negotiation");
        self.negotiator.retract().await?;
        Ok(())
    }

    /// Adds the captured local tracks to the connection. The engine answers
    /// with a negotiation-needed event that drives the renegotiation.
    pub async fn attach_local_media(&mut self) -> Result<(), SessionError> {
        if !self.call_active {
            return Err(SessionError::CallInactive);
        }
        let media = match &self.local_media {
            Some(media) => media.clone(),
            None => {
                let media = self.media.capture().await?;
                self.local_media = Some(media.clone());
                media
            }
        };
        let mut added = 0;
        for track in &media.tracks {
            if self.attached_tracks.contains(&track.id) {
                continue;
            }
            self.peer.add_track(&media.stream_id, track).await?;
            self.attached_tracks.insert(track.id.clone());
            added += 1;
        }
        if added > 0 {
            tracing::info!(target = "session", tracks = added, "local media attached");
            self.notify(Notice::StreamsSent { tracks: added });
            self.publish_snapshot();
        }
        Ok(())
    }

    /// Leaves the room and forgets the call. The peer connection stays open.
    pub fn teardown(&mut self) {
        self.relay.leave();
        self.negotiator.unbind();
        while self.events_rx.try_recv().is_ok() {}
        if let Some(local) = self.joined.take() {
            tracing::info!(target = "session", room = %local.room, "session torn down");
        }
        self.remote_peer = None;
        self.call_active = false;
        self.local_media = None;
        self.attached_tracks.clear();
        self.remote_media = None;
        self.publish_snapshot();
    }

    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.teardown();
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.peer.close().await?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Applies everything already queued and returns how many events ran.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event).await;
            handled += 1;
        }
        handled
    }

    /// Processes events until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => break,
                },
            }
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Membership(event) => {
                let for_us = self
                    .joined
                    .as_ref()
                    .is_some_and(|local| local.room == event.room);
                if for_us {
                    self.on_peer_joined(&event.identity);
                }
                Ok(())
            }
            SessionEvent::Signal(envelope) => self.handle_signal(envelope).await,
            SessionEvent::Peer(event) => self.handle_peer_event(event).await,
        }
    }

    async fn apply(&mut self, event: SessionEvent) {
        if let Err(err) = self.handle_event(event).await {
            tracing::warn!(target = "session", error = %err, "session event failed");
            self.notify(Notice::Failure {
                reason: err.to_string(),
            });
            self.publish_snapshot();
        }
    }

    async fn handle_signal(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        if self.joined.is_none() {
            tracing::debug!(target = "session", %envelope, "signal while not joined");
            return Ok(());
        }
        let outcome = self.negotiator.dispatch(&envelope).await?;
        if envelope.kind() == SignalKind::Success && outcome == Outcome::Accepted {
            self.on_call_accepted().await;
        }
        self.publish(outcome).await;
        self.replay_renegotiation().await?;
        self.publish_snapshot();
        Ok(())
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), SessionError> {
        match event {
            PeerEvent::NegotiationNeeded => {
                if self.joined.is_none() {
                    return Ok(());
                }
                let outcome = self.negotiator.on_renegotiation_needed().await?;
                self.publish(outcome).await;
            }
            PeerEvent::IceCandidate(candidate) => {
                if self.joined.is_none() {
                    return Ok(());
                }
                let outcome = self.negotiator.local_candidate(candidate)?;
                self.publish(outcome).await;
            }
            PeerEvent::Track(track) => self.on_remote_track(track),
            PeerEvent::ConnectionState(status) => {
                if self.connection != status {
                    tracing::info!(target = "session", ?status, "connection state changed");
                    self.connection = status;
                }
            }
        }
        self.publish_snapshot();
        Ok(())
    }

    /// First accepted `success` activates the call and captures local media.
    async fn on_call_accepted(&mut self) {
        if self.call_active {
            return;
        }
        self.call_active = true;
        tracing::info!(
            target = "session",
            peer = self.negotiator.remote_peer().unwrap_or(""),
            "call accepted"
        );
        self.notify(Notice::CallAccepted);
        if self.local_media.is_none() {
            match self.media.capture().await {
                Ok(media) => self.local_media = Some(media),
                Err(err) => {
                    tracing::warn!(target = "session", error = %err, "local media capture failed");
                    self.notify(Notice::Failure {
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn on_remote_track(&mut self, track: RemoteTrack) {
        let kind = track.kind.to_string();
        let media = self.remote_media.get_or_insert_with(|| RemoteMedia {
            stream_id: track.stream_id.clone(),
            tracks: Vec::new(),
        });
        if media.add(track) {
            tracing::info!(target = "session", %kind, "remote track received");
            self.notify(Notice::RemoteTrack { kind });
        }
    }

    async fn replay_renegotiation(&mut self) -> Result<(), SessionError> {
        if self.negotiator.renegotiation_due() {
            let outcome = self.negotiator.on_renegotiation_needed().await?;
            self.publish(outcome).await;
        }
        Ok(())
    }

    /// Hands outbound envelopes to the room service. Failures are reported
    /// and otherwise ignored; the user can retry the call.
    async fn publish(&mut self, outcome: Outcome) {
        let Outcome::Publish(envelopes) = outcome else {
            return;
        };
        for envelope in envelopes {
            match self.rooms.relay(&envelope).await {
                Ok(ack) => {
                    tracing::debug!(target = "session", %envelope, message = %ack.message, "envelope relayed");
                    self.notify(Notice::RelayAccepted {
                        message: ack.message,
                    });
                }
                Err(err) => {
                    tracing::warn!(target = "session", %envelope, error = %err, "relay failed");
                    self.notify(Notice::RelayRejected {
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn publish_snapshot(&self) {
        let next = SessionSnapshot {
            room: self.joined.as_ref().map(|local| local.room.clone()),
            identity: self.joined.as_ref().map(|local| local.identity.clone()),
            joined: self.joined.is_some(),
            peer: self
                .negotiator
                .remote_peer()
                .map(str::to_string)
                .or_else(|| self.remote_peer.clone()),
            role: self.negotiator.role(),
            negotiation: self.negotiator.state(),
            call_active: self.call_active,
            local_stream: self.local_media.as_ref().map(|media| media.stream_id.clone()),
            remote_stream: self
                .remote_media
                .as_ref()
                .map(|media| media.stream_id.clone()),
            connection: self.connection,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
