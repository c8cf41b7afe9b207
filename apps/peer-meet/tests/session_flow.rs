use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use peer_meet::media::SyntheticMediaSource;
use peer_meet::negotiation::{NegotiationState, Role};
use peer_meet::peer::mock::PeerCall;
use peer_meet::peer::{IceCandidate, MockPeer, PeerEvent, SessionDescription};
use peer_meet::relay::GLOBAL_TOPIC;
use peer_meet::session::{
    LocalRoomService, Notice, RoomAck, RoomService, RoomServiceError, SessionCoordinator,
};
use peer_meet::signaling::{self, Envelope, Recipient, SignalKind, SignalPayload};
use relay_bus::{Bus, LocalBus, RelayMessage};
use tokio::sync::broadcast;

const ROOM: &str = "42";

struct Participant {
    session: SessionCoordinator,
    peer: MockPeer,
}

fn participant(label: &str, bus: &Arc<LocalBus>, rooms: Arc<dyn RoomService>) -> Participant {
    let peer = MockPeer::new(label);
    let session = SessionCoordinator::new(
        Arc::new(peer.clone()),
        rooms,
        bus.clone(),
        Arc::new(SyntheticMediaSource),
    );
    Participant { session, peer }
}

/// Lets relay forwarders run, then applies whatever reached the session.
async fn step(session: &mut SessionCoordinator) -> usize {
    tokio::time::sleep(Duration::from_millis(10)).await;
    session.pump().await
}

async fn settle(a: &mut SessionCoordinator, b: &mut SessionCoordinator) {
    let mut quiet = 0;
    while quiet < 3 {
        let handled = step(a).await + step(b).await;
        quiet = if handled == 0 { quiet + 1 } else { 0 };
    }
}

async fn next_envelope(spy: &mut broadcast::Receiver<RelayMessage>) -> Envelope {
    let message = tokio::time::timeout(Duration::from_secs(1), spy.recv())
        .await
        .expect("relay message in time")
        .expect("relay open");
    let text = std::str::from_utf8(&message.payload).expect("utf-8 payload");
    signaling::decode(text).expect("valid envelope")
}

fn count(peer: &MockPeer, predicate: impl Fn(&PeerCall) -> bool) -> usize {
    peer.calls().iter().filter(|call| predicate(call)).count()
}

async fn joined_pair(
    bus: &Arc<LocalBus>,
    rooms: Arc<dyn RoomService>,
) -> (Participant, Participant) {
    let mut alice = participant("alice", bus, rooms.clone());
    let mut bob = participant("bob", bus, rooms);
    alice.session.join_room(ROOM, "alice").await.unwrap();
    bob.session.join_room(ROOM, "bob").await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    (alice, bob)
}

#[test_timeout::tokio_timeout_test]
async fn call_setup_and_media_renegotiation() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    let mut spy = bus.subscribe(GLOBAL_TOPIC);

    // Alice learns about bob from the membership event.
    assert_eq!(alice.session.remote_peer(), Some("bob"));

    alice.session.start_call().await.unwrap();
    assert_eq!(alice.session.negotiation_state(), NegotiationState::OfferSent);
    let offer = next_envelope(&mut spy).await;
    assert_eq!(offer.kind(), SignalKind::Offer);
    assert_eq!(offer.from, "alice");
    assert_eq!(offer.to, Recipient::peer("bob"));

    step(&mut bob.session).await;
    assert_eq!(bob.session.negotiation_state(), NegotiationState::AnswerExchanged);
    let answer = next_envelope(&mut spy).await;
    assert_eq!(answer.kind(), SignalKind::Answer);
    assert_eq!(answer.from, "bob");
    assert_eq!(answer.to, Recipient::peer("alice"));

    step(&mut alice.session).await;
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    let success = next_envelope(&mut spy).await;
    assert_eq!(success.kind(), SignalKind::Success);
    assert_eq!(success.from, "alice");
    assert_eq!(success.to, Recipient::All);

    settle(&mut alice.session, &mut bob.session).await;
    assert!(alice.session.call_active());
    assert!(bob.session.call_active());
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);

    alice.session.attach_local_media().await.unwrap();
    step(&mut alice.session).await;
    let reoffer = next_envelope(&mut spy).await;
    assert_eq!(reoffer.kind(), SignalKind::Offer);
    assert_eq!(reoffer.to, Recipient::peer("bob"));
    assert_ne!(reoffer.payload, offer.payload);
    assert_eq!(alice.session.remote_peer(), Some("bob"));
    assert!(alice.session.call_active());

    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.peer.remote_description_sets(), 2);
    assert_eq!(alice.peer.tracks().len(), 2);

    // Attaching again adds nothing and triggers no further offer.
    alice.session.attach_local_media().await.unwrap();
    assert_eq!(alice.peer.tracks().len(), 2);

    let snapshot = alice.session.snapshot();
    assert_eq!(snapshot.peer.as_deref(), Some("bob"));
    assert_eq!(snapshot.role, Some(Role::Initiator));
    assert!(snapshot.local_stream.is_some());
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_calls_converge_on_one_round() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    bob.session.on_peer_joined("alice");

    alice.session.start_call().await.unwrap();
    bob.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;

    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);
    assert!(alice.session.call_active());
    assert!(bob.session.call_active());

    assert_eq!(count(&alice.peer, |call| *call == PeerCall::Rollback), 0);
    assert_eq!(count(&bob.peer, |call| *call == PeerCall::Rollback), 1);
    assert_eq!(alice.peer.remote_description_sets(), 1);
    assert_eq!(bob.session.snapshot().role, Some(Role::Responder));
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_are_applied_after_the_offer() {
    let bus = Arc::new(LocalBus::new());
    let local = Arc::new(LocalRoomService::new(bus.clone()));
    let rooms: Arc<dyn RoomService> = local.clone();
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    local
        .relay(&Envelope::new(
            ROOM,
            "alice",
            Recipient::peer("bob"),
            SignalPayload::Candidate(candidate.clone()),
        ))
        .await
        .unwrap();
    step(&mut bob.session).await;
    assert_eq!(
        count(&bob.peer, |call| matches!(call, PeerCall::AddCandidate(_))),
        0
    );

    alice.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;

    let calls = bob.peer.calls();
    let remote_at = calls
        .iter()
        .position(|call| matches!(call, PeerCall::SetRemote(_)))
        .expect("offer applied");
    let candidate_at = calls
        .iter()
        .position(|call| *call == PeerCall::AddCandidate(candidate.clone()))
        .expect("candidate applied");
    assert!(candidate_at > remote_at);
}

#[test_timeout::tokio_timeout_test]
async fn local_candidates_follow_the_offer() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let (mut alice, _bob) = joined_pair(&bus, rooms).await;
    let mut spy = bus.subscribe(GLOBAL_TOPIC);

    alice.peer.emit(PeerEvent::IceCandidate(IceCandidate {
        candidate: "candidate:7 1 udp 1 10.0.0.7 7000 typ host".into(),
        sdp_mid: None,
        sdp_mline_index: Some(0),
        username_fragment: None,
    }));
    step(&mut alice.session).await;

    alice.session.start_call().await.unwrap();
    assert_eq!(next_envelope(&mut spy).await.kind(), SignalKind::Offer);
    let candidate = next_envelope(&mut spy).await;
    assert_eq!(candidate.kind(), SignalKind::Candidate);
    assert_eq!(candidate.to, Recipient::peer("bob"));
}

#[test_timeout::tokio_timeout_test]
async fn foreign_and_echoed_offers_leave_the_session_idle() {
    let bus = Arc::new(LocalBus::new());
    let local = Arc::new(LocalRoomService::new(bus.clone()));
    let rooms: Arc<dyn RoomService> = local.clone();
    let (_alice, mut bob) = joined_pair(&bus, rooms).await;

    let offer = |room: &str, from: &str| {
        Envelope::new(
            room,
            from,
            Recipient::peer("bob"),
            SignalPayload::Offer(SessionDescription::offer(format!("{from}-offer"))),
        )
    };
    local.relay(&offer("7", "alice")).await.unwrap();
    local.relay(&offer(ROOM, "bob")).await.unwrap();
    step(&mut bob.session).await;

    assert_eq!(bob.session.negotiation_state(), NegotiationState::Idle);
    assert_eq!(bob.peer.remote_description_sets(), 0);
}

/// Room service whose relay endpoint fails a fixed number of times,
/// optionally only for one kind of envelope.
struct FlakyRooms {
    inner: LocalRoomService,
    only: Option<SignalKind>,
    failures_left: AtomicUsize,
}

impl FlakyRooms {
    fn new(bus: &Arc<LocalBus>, only: Option<SignalKind>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalRoomService::new(bus.clone()),
            only,
            failures_left: AtomicUsize::new(failures),
        })
    }

    fn fail_next(&self, failures: usize) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoomService for FlakyRooms {
    async fn register(&self, room: &str, username: &str) -> Result<RoomAck, RoomServiceError> {
        self.inner.register(room, username).await
    }

    async fn relay(&self, envelope: &Envelope) -> Result<RoomAck, RoomServiceError> {
        if self.only.is_some_and(|kind| kind != envelope.kind()) {
            return self.inner.relay(envelope).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RoomServiceError::Rejected {
                status: 500,
                message: "relay unavailable".into(),
            });
        }
        self.inner.relay(envelope).await
    }
}

#[test_timeout::tokio_timeout_test]
async fn relay_rejection_is_reported_and_call_can_be_retried() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = FlakyRooms::new(&bus, None, 1);
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    let mut notices = alice.session.subscribe_notices();

    alice.session.start_call().await.unwrap();
    assert!(matches!(
        notices.try_recv(),
        Ok(Notice::RelayRejected { .. })
    ));
    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(alice.session.negotiation_state(), NegotiationState::OfferSent);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Idle);

    alice.session.start_call().await.unwrap();
    assert_eq!(count(&alice.peer, |call| *call == PeerCall::Rollback), 1);
    settle(&mut alice.session, &mut bob.session).await;
    assert!(alice.session.call_active());
    assert!(bob.session.call_active());
}

fn rejected(notices: &mut broadcast::Receiver<Notice>) -> usize {
    let mut rejected = 0;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, Notice::RelayRejected { .. }) {
            rejected += 1;
        }
    }
    rejected
}

#[test_timeout::tokio_timeout_test]
async fn lost_success_is_recovered_by_calling_again() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = FlakyRooms::new(&bus, Some(SignalKind::Success), 1);
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    let mut notices = alice.session.subscribe_notices();

    alice.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(rejected(&mut notices), 1);
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert!(!alice.session.call_active());
    assert_eq!(bob.session.negotiation_state(), NegotiationState::AnswerExchanged);
    assert!(!bob.session.call_active());

    alice.session.start_call().await.unwrap();
    assert_eq!(alice.session.negotiation_state(), NegotiationState::OfferSent);
    settle(&mut alice.session, &mut bob.session).await;

    assert!(alice.session.call_active());
    assert!(bob.session.call_active());
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(count(&alice.peer, |call| *call == PeerCall::CreateOffer), 2);
    assert_eq!(alice.session.snapshot().role, Some(Role::Initiator));
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_media_renegotiation_sends_both_sides_tracks() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    alice.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert!(bob.session.call_active());

    // Both offers leave before either side sees the other's.
    alice.session.attach_local_media().await.unwrap();
    bob.session.attach_local_media().await.unwrap();
    alice.session.pump().await;
    bob.session.pump().await;
    assert_eq!(alice.session.negotiation_state(), NegotiationState::OfferSent);
    assert_eq!(count(&bob.peer, |call| *call == PeerCall::CreateOffer), 1);

    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(count(&bob.peer, |call| *call == PeerCall::Rollback), 1);
    assert_eq!(count(&bob.peer, |call| *call == PeerCall::CreateOffer), 2);
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);

    let applied = alice.peer.remote_description().expect("remote description");
    assert_eq!(applied, bob.peer.local_description().expect("local description"));
    assert!(applied.sdp.starts_with("bob-offer"));
}

#[test_timeout::tokio_timeout_test]
async fn responder_recovers_a_stalled_renegotiation_during_the_call() {
    let bus = Arc::new(LocalBus::new());
    let flaky = FlakyRooms::new(&bus, Some(SignalKind::Success), 0);
    let rooms: Arc<dyn RoomService> = flaky.clone();
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    alice.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert!(bob.session.call_active());

    // Alice renegotiates and her success never reaches bob.
    flaky.fail_next(1);
    alice.session.attach_local_media().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::AnswerExchanged);

    // Bob's own media waits behind the stalled round.
    bob.session.attach_local_media().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert_eq!(count(&bob.peer, |call| *call == PeerCall::CreateOffer), 0);

    bob.session.start_call().await.unwrap();
    assert!(bob.session.call_active());
    assert_eq!(bob.session.negotiation_state(), NegotiationState::OfferSent);
    settle(&mut alice.session, &mut bob.session).await;

    assert_eq!(alice.session.negotiation_state(), NegotiationState::Connected);
    assert_eq!(bob.session.negotiation_state(), NegotiationState::Connected);
    assert!(alice.session.call_active());
    let applied = alice.peer.remote_description().expect("remote description");
    assert!(applied.sdp.starts_with("bob-offer"));

    // With nothing stalled the call cannot be started again.
    assert!(matches!(
        bob.session.start_call().await,
        Err(peer_meet::session::SessionError::CallActive)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn teardown_twice_then_rejoin() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let (mut alice, mut bob) = joined_pair(&bus, rooms).await;
    alice.session.start_call().await.unwrap();
    settle(&mut alice.session, &mut bob.session).await;
    assert!(alice.session.call_active());

    alice.session.teardown();
    alice.session.teardown();
    // Aborted forwarders release their subscriptions once the runtime polls them.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = alice.session.snapshot();
    assert!(!snapshot.joined);
    assert!(!snapshot.call_active);
    assert_eq!(snapshot.negotiation, NegotiationState::Idle);
    assert_eq!(bus.subscriber_count("chat-42"), 1);
    assert!(!alice.peer.is_closed());

    alice.session.join_room(ROOM, "alice").await.unwrap();
    assert!(alice.session.snapshot().joined);
    assert_eq!(bus.subscriber_count("chat-42"), 2);
}

#[test_timeout::tokio_timeout_test]
async fn switching_rooms_leaves_the_old_one() {
    let bus = Arc::new(LocalBus::new());
    let rooms: Arc<dyn RoomService> = Arc::new(LocalRoomService::new(bus.clone()));
    let mut alice = participant("alice", &bus, rooms);
    let mut watch = alice.session.watch();

    alice.session.join_room(ROOM, "alice").await.unwrap();
    alice.session.join_room("43", "alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.subscriber_count("chat-42"), 0);
    assert_eq!(bus.subscriber_count("chat-43"), 1);

    assert!(watch.has_changed().unwrap());
    assert_eq!(watch.borrow_and_update().room.as_deref(), Some("43"));
}
