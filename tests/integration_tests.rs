//! Integration tests for full peer sessions.
//!
//! Two engines talk through the in-memory relay and transport, exercising
//! authentication, perfect negotiation, encrypted channels and teardown
//! across parley-core and parley-crypto.

use parley_core::mock::MockCall;
use parley_core::store::PeerRecord;
use parley_core::transport::SdpType;
use parley_core::{
    ChannelConfig, ChannelState, EngineConfig, EngineEvent, IceCandidate, PeerError, Phase, Role,
    SecureCodec, SessionDescription, SignalingMessage, SignalingSink, StoreSnapshot,
};
use parley_crypto::{AeadKey, NativeProvider, PeerId};
use parley_integration_tests::fixtures::{TestPeer, TwoPeerFixture, identity};
use std::sync::Arc;
use std::time::Duration;

const LABEL: &str = "chat";

fn candidate_message(from: &PeerId, to: &PeerId, room_id: &str, candidate: &str) -> String {
    SignalingMessage::Candidate {
        candidate: IceCandidate::new(candidate),
        from_peer_id: from.clone(),
        to_peer_id: to.clone(),
        room_id: room_id.to_string(),
    }
    .encode()
    .unwrap()
}

fn description_message(
    from: &PeerId,
    to: &PeerId,
    room_id: &str,
    description: SessionDescription,
) -> String {
    SignalingMessage::Description {
        description,
        from_peer_id: from.clone(),
        to_peer_id: to.clone(),
        room_id: room_id.to_string(),
    }
    .encode()
    .unwrap()
}

fn position(calls: &[MockCall], call: &MockCall) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call:?} not recorded in {calls:?}"))
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_mutual_authentication() {
    let mut fixture = TwoPeerFixture::new();
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    // Nothing negotiates before trust is established.
    assert!(matches!(
        fixture.impolite.engine.connect(&polite).await,
        Err(PeerError::AuthenticationFailed(_))
    ));

    fixture
        .impolite
        .engine
        .introduce(&fixture.room_id, None)
        .await
        .unwrap();

    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
        .await;
    assert_eq!(event.peer_id(), &impolite);
    let event = fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
        .await;
    assert_eq!(event.peer_id(), &polite);

    assert!(fixture.polite.engine.is_trusted(&impolite));
    assert!(fixture.impolite.engine.is_trusted(&polite));

    let known = fixture.impolite.engine.peer(&polite).unwrap();
    assert_eq!(&known.public_key, fixture.polite.engine.public_key());
    assert_eq!(
        fixture.impolite.engine.peers_in_room(&fixture.room_id),
        vec![polite.clone()]
    );
    assert_eq!(fixture.polite.engine.role(&impolite), Role::Polite);
    assert_eq!(fixture.impolite.engine.role(&polite), Role::Impolite);

    // Each side persisted the verified peer.
    assert_eq!(fixture.impolite.store.snapshot().peers.len(), 1);

    fixture.cleanup();
}

#[tokio::test]
async fn test_challenge_for_other_room_ignored() {
    let fixture = TwoPeerFixture::new();
    let stranger = identity();
    let (sink, _inbound) = fixture.relay.connect(stranger.peer_id());

    let challenge = SignalingMessage::PeerId {
        challenge: "c".repeat(64),
        message: "hello".into(),
        from_peer_id: Some(stranger.peer_id().clone()),
        to_peer_id: None,
        room_id: Some("not-a-joined-room".into()),
    };
    sink.send(challenge.encode().unwrap()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fixture.polite.engine.is_trusted(stranger.peer_id()));
    assert!(fixture.polite.engine.peers().is_empty());
    assert!(fixture.impolite.engine.peers().is_empty());

    fixture.cleanup();
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test]
async fn test_negotiation_reaches_connected() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    fixture.impolite.engine.connect(&polite).await.unwrap();

    fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;

    assert_eq!(
        fixture.impolite.engine.phase(&polite).await,
        Some(Phase::Connected)
    );
    assert_eq!(
        fixture.polite.engine.phase(&impolite).await,
        Some(Phase::Connected)
    );

    fixture.cleanup();
}

#[tokio::test]
async fn test_glare_resolved_in_favor_of_impolite_offer() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    // Both offers are in flight before either side sees the other's.
    fixture.relay.hold();
    let (a, b) = tokio::join!(
        fixture.polite.engine.connect(&impolite),
        fixture.impolite.engine.connect(&polite),
    );
    a.unwrap();
    b.unwrap();
    fixture.relay.release();

    fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;

    let polite_conn = fixture.polite_connection().unwrap();
    let impolite_conn = fixture.impolite_connection().unwrap();

    // The polite side rolled back and applied the impolite offer.
    let applied = polite_conn.applied_remote();
    assert_eq!(applied[0].kind, SdpType::Offer);
    assert!(applied[0].sdp.contains(impolite.as_str()));
    assert!(polite_conn.calls().contains(&MockCall::Rollback));

    // The impolite side never applied a remote offer.
    assert!(
        impolite_conn
            .applied_remote()
            .iter()
            .all(|d| d.kind == SdpType::Answer)
    );
    assert!(!impolite_conn.calls().contains(&MockCall::Rollback));

    fixture.cleanup();
}

#[tokio::test]
async fn test_candidates_buffered_until_remote_description() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    let early = "candidate:early 1 udp 1 10.0.0.1 40000 typ host";
    fixture
        .polite
        .engine
        .handle_signaling(&candidate_message(&impolite, &polite, &fixture.room_id, early))
        .await
        .unwrap();

    let connection = fixture.polite_connection().unwrap();
    assert!(connection.remote_candidates().is_empty());
    assert!(
        !connection
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::AddCandidate(_)))
    );

    fixture.impolite.engine.connect(&polite).await.unwrap();
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;

    let calls = connection.calls();
    let remote = position(&calls, &MockCall::SetRemote(SdpType::Offer));
    let added = position(&calls, &MockCall::AddCandidate(early.to_string()));
    assert!(remote < added);

    let applied: Vec<_> = connection
        .remote_candidates()
        .into_iter()
        .filter(|c| c.candidate == early)
        .collect();
    assert_eq!(applied.len(), 1);

    fixture.cleanup();
}

#[tokio::test]
async fn test_malformed_description_fails_negotiation() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    let raw = description_message(
        &impolite,
        &polite,
        &fixture.room_id,
        SessionDescription::offer("not an sdp"),
    );
    let result = fixture.polite.engine.handle_signaling(&raw).await;
    assert!(matches!(result, Err(PeerError::NegotiationFailed(_))));

    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::NegotiationFailed { .. }))
        .await;
    assert_eq!(event.peer_id(), &impolite);
    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::PeerClosed {
            reason: Some(PeerError::NegotiationFailed(_)),
            ..
        }
    ));

    assert!(fixture.polite.engine.peer(&impolite).is_none());
    assert!(!fixture.polite.engine.is_trusted(&impolite));
    assert!(fixture.polite_connection().unwrap().is_closed());

    fixture.cleanup();
}

#[tokio::test]
async fn test_negotiation_timeout_tears_down() {
    let mut config = EngineConfig::default();
    config.negotiation.timeout = Duration::from_millis(200);
    let mut fixture = TwoPeerFixture::with_config(config);
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    // A lone candidate creates the connection but nothing negotiates it.
    fixture
        .polite
        .engine
        .handle_signaling(&candidate_message(
            &impolite,
            &polite,
            &fixture.room_id,
            "candidate:orphan",
        ))
        .await
        .unwrap();

    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::NegotiationFailed { .. }))
        .await;
    assert!(matches!(
        event,
        EngineEvent::NegotiationFailed {
            error: PeerError::NegotiationTimeout(ref id),
            ..
        } if *id == impolite
    ));
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await;
    assert!(fixture.polite.engine.peer(&impolite).is_none());

    fixture.cleanup();
}

#[tokio::test]
async fn test_transport_failure_tears_down_both_sides() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());
    fixture.open_channel(LABEL).await;

    fixture.network.fail(&polite, &impolite);

    for peer in [&mut fixture.polite, &mut fixture.impolite] {
        let event = peer
            .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
            .await;
        assert!(matches!(
            event,
            EngineEvent::PeerClosed {
                reason: Some(PeerError::Transport(_)),
                ..
            }
        ));
    }
    assert!(fixture.polite.engine.peers().is_empty());
    assert!(fixture.impolite.engine.peers().is_empty());

    fixture.cleanup();
}

// ============================================================================
// Channels and messaging
// ============================================================================

#[tokio::test]
async fn test_encrypted_chunked_messaging() {
    let mut config = EngineConfig::default();
    config.channel.max_chunk_bytes = 64;
    let mut fixture = TwoPeerFixture::with_config(config);
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());

    let (a, b) = fixture.open_channel(LABEL).await;
    assert_eq!(a.state, ChannelState::Open);
    assert_eq!(b.state, ChannelState::Open);

    let body = format!("{} – ünïcödé", "x".repeat(1000));
    let sent = fixture
        .impolite
        .engine
        .send(&polite, LABEL, &body)
        .await
        .unwrap();
    assert_eq!(sent.id.len(), 32);

    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::MessageReceived { .. }))
        .await;
    let EngineEvent::MessageReceived { message, label, .. } = event else {
        unreachable!();
    };
    assert_eq!(label, LABEL);
    assert_eq!(message.message, body);
    assert_eq!(message.id, sent.id);
    assert_eq!(message.from_peer_id, impolite);
    assert_eq!(message.to_peer_id, polite);

    let reply = fixture
        .polite
        .engine
        .send(&impolite, LABEL, "short reply")
        .await
        .unwrap();
    let event = fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::MessageReceived { .. }))
        .await;
    assert!(matches!(event, EngineEvent::MessageReceived { ref message, .. } if message.id == reply.id));

    // Both sides hold and persisted both messages.
    for peer in [&fixture.polite, &fixture.impolite] {
        let other = if peer.id() == polite { &impolite } else { &polite };
        let channel = peer.engine.channel(other, LABEL).await.unwrap();
        assert_eq!(channel.messages().len(), 2);
        assert_eq!(peer.store.snapshot().messages.len(), 2);
        assert!(peer.engine.has_cached_key(other).await);
    }

    fixture.cleanup();
}

#[tokio::test]
async fn test_unauthentic_frames_are_contained() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let (polite, impolite) = (fixture.polite.id(), fixture.impolite.id());
    fixture.open_channel(LABEL).await;

    // Sealed under the wrong key.
    let codec = SecureCodec::new(Arc::new(NativeProvider), &ChannelConfig::default());
    let forged = codec
        .seal(
            &AeadKey::new([7u8; 32]),
            &"ab".repeat(16),
            &impolite,
            &polite,
            0,
            "forged",
        )
        .unwrap();
    let raw = forged[0].encode().unwrap();
    assert_eq!(
        fixture
            .polite
            .engine
            .channel_message(&impolite, LABEL, &raw)
            .await,
        Err(PeerError::DecryptionFailed)
    );

    let garbage = fixture
        .polite
        .engine
        .channel_message(&impolite, LABEL, "{not json")
        .await
        .unwrap_err();
    assert!(garbage.is_contained());

    // The channel survives and still carries real traffic.
    let channel = fixture.polite.engine.channel(&impolite, LABEL).await.unwrap();
    assert_eq!(channel.state, ChannelState::Open);
    assert!(channel.messages().is_empty());

    fixture
        .impolite
        .engine
        .send(&polite, LABEL, "genuine")
        .await
        .unwrap();
    let event = fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::MessageReceived { .. }))
        .await;
    assert!(matches!(event, EngineEvent::MessageReceived { ref message, .. } if message.message == "genuine"));

    fixture.cleanup();
}

#[tokio::test]
async fn test_channel_open_timeout() {
    let mut config = EngineConfig::default();
    config.channel.open_timeout = Duration::from_millis(200);
    let mut fixture = TwoPeerFixture::with_config(config);
    fixture.authenticate().await;
    let impolite = fixture.impolite.id();

    // The polite side never creates channels, and nobody creates this one.
    let result = fixture
        .polite
        .engine
        .open_channel(&fixture.room_id, &impolite, "lonely")
        .await;
    assert_eq!(result, Err(PeerError::ChannelOpenTimeout("lonely".into())));
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::ChannelClosed { label, .. } if label == "lonely"))
        .await;

    let channel = fixture
        .polite
        .engine
        .channel(&impolite, "lonely")
        .await
        .unwrap();
    assert_eq!(channel.state, ChannelState::Closed);

    fixture.cleanup();
}

#[tokio::test]
async fn test_close_and_reopen_keeps_history() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let polite = fixture.polite.id();
    fixture.open_channel(LABEL).await;

    fixture
        .impolite
        .engine
        .send(&polite, LABEL, "before close")
        .await
        .unwrap();
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::MessageReceived { .. }))
        .await;

    fixture
        .impolite
        .engine
        .close_channel(&polite, LABEL, false)
        .await
        .unwrap();
    fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::ChannelClosed { .. }))
        .await;
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::ChannelClosed { .. }))
        .await;

    let closed = fixture.impolite.engine.channel(&polite, LABEL).await.unwrap();
    assert_eq!(closed.state, ChannelState::Closed);
    assert_eq!(closed.messages().len(), 1);
    assert!(matches!(
        fixture.impolite.engine.send(&polite, LABEL, "nope").await,
        Err(PeerError::InvalidState(_))
    ));

    let (a, b) = fixture.open_channel(LABEL).await;
    assert_eq!(a.messages().len(), 1);
    assert_eq!(b.messages().len(), 1);

    fixture
        .impolite
        .engine
        .close_channel(&polite, LABEL, true)
        .await
        .unwrap();
    let purged = fixture.impolite.engine.channel(&polite, LABEL).await.unwrap();
    assert!(purged.messages().is_empty());
    assert!(fixture.impolite.store.snapshot().messages.is_empty());
    // The remote side's history is its own.
    assert_eq!(fixture.polite.store.snapshot().messages.len(), 1);

    assert!(matches!(
        fixture.impolite.engine.close_channel(&polite, "unknown", false).await,
        Err(PeerError::ChannelNotFound { .. })
    ));

    fixture.cleanup();
}

// ============================================================================
// Teardown and restore
// ============================================================================

#[tokio::test]
async fn test_disconnect_removes_everything() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let polite = fixture.polite.id();
    fixture.open_channel(LABEL).await;
    fixture
        .impolite
        .engine
        .send(&polite, LABEL, "hello")
        .await
        .unwrap();

    fixture.impolite.drain();
    fixture.impolite.engine.disconnect(&polite).await.unwrap();

    let event = fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::ChannelClosed { .. }))
        .await;
    assert!(matches!(event, EngineEvent::ChannelClosed { ref label, .. } if label == LABEL));
    let event = fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await;
    assert!(matches!(event, EngineEvent::PeerClosed { reason: None, .. }));

    let engine = &fixture.impolite.engine;
    assert!(engine.peer(&polite).is_none());
    assert!(!engine.is_trusted(&polite));
    assert!(engine.peers_in_room(&fixture.room_id).is_empty());
    assert!(engine.channels_for_peer(&polite).await.is_empty());
    assert!(!engine.has_cached_key(&polite).await);
    assert_eq!(engine.phase(&polite).await, None);
    assert!(fixture.impolite_connection().unwrap().is_closed());

    // The remote side observes the closed connection.
    fixture
        .polite
        .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await;

    assert!(matches!(
        fixture.impolite.engine.disconnect(&polite).await,
        Err(PeerError::PeerNotFound(_))
    ));

    fixture.cleanup();
}

#[tokio::test]
async fn test_leave_room_tears_down_members() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let polite = fixture.polite.id();
    let room_id = fixture.room_id.clone();

    fixture.impolite.engine.leave_room(&room_id).await.unwrap();
    let event = fixture
        .impolite
        .wait_for(|e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await;
    assert_eq!(event.peer_id(), &polite);
    assert!(fixture.impolite.engine.peer(&polite).is_none());

    assert_eq!(
        fixture.impolite.engine.leave_room(&room_id).await,
        Err(PeerError::RoomNotFound(room_id.clone()))
    );
    assert!(matches!(
        fixture.impolite.engine.introduce(&room_id, None).await,
        Err(PeerError::RoomNotFound(_))
    ));

    fixture.cleanup();
}

#[tokio::test]
async fn test_restore_from_snapshot() {
    let mut fixture = TwoPeerFixture::new();
    fixture.authenticate().await;
    let polite = fixture.polite.id();
    fixture.open_channel(LABEL).await;

    for body in ["first", "second"] {
        fixture
            .impolite
            .engine
            .send(&polite, LABEL, body)
            .await
            .unwrap();
    }

    let mut snapshot: StoreSnapshot = fixture.impolite.store.snapshot();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.channels.len(), 1);
    assert_eq!(snapshot.messages.len(), 2);
    let slot = snapshot.peers[0].connection_index;

    // A record whose key does not hash to its id is never restored.
    let impostor = identity();
    snapshot.peers.push(PeerRecord {
        id: impostor.peer_id().clone(),
        public_key: *fixture.polite.engine.public_key(),
        connection_index: 7,
    });

    // Serialized snapshots survive a round trip through the store format.
    let snapshot: StoreSnapshot =
        serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();

    let network = parley_core::mock::MockNetwork::new();
    let relay = parley_core::mock::MockRelay::new();
    let fresh = TestPeer::spawn(identity(), EngineConfig::default(), &network, &relay);

    assert_eq!(fresh.engine.restore(snapshot.clone()).await, 2);
    assert_eq!(fresh.engine.restore(snapshot).await, 0);

    let restored = fresh.engine.peer(&polite).unwrap();
    assert_eq!(restored.connection_index, slot);
    assert!(fresh.engine.peer(impostor.peer_id()).is_none());
    // Restored peers must authenticate again.
    assert!(!fresh.engine.is_trusted(&polite));

    let channel = fresh.engine.channel(&polite, LABEL).await.unwrap();
    assert_eq!(channel.state, ChannelState::Closed);
    let bodies: Vec<_> = channel.messages().iter().map(|m| m.message.as_str()).collect();
    assert_eq!(bodies.len(), 2);
    assert!(bodies.contains(&"first") && bodies.contains(&"second"));

    fresh.stop();
    fixture.cleanup();
}
