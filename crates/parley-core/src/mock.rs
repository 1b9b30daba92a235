//! In-memory transport and relay.
//!
//! [`MockNetwork`] stands in for the native peer-connection stack: it
//! enforces signaling-state rules, gathers one fake candidate per applied
//! local description, reports `Connected` once both sides are negotiated and
//! hold a remote candidate, and links data channels between the two
//! endpoints. [`MockRelay`] routes serialized signaling by `toPeerId` and
//! broadcasts the rest. Every call is recorded for inspection.

use crate::config::RtcConfig;
use crate::negotiation::SignalingState;
use crate::signaling::SignalingMessage;
use crate::transport::{
    ConnectionFactory, DataChannel, IceCandidate, RtcConnection, SdpType, SessionDescription,
    SignalingSink, TransportConnectionState, TransportError, TransportEvent, TransportEventSender,
    TransportResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parley_crypto::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

const OFFER_PREFIX: &str = "mock-offer:";
const ANSWER_PREFIX: &str = "mock-answer:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transport call, as recorded by [`MockConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocal(SdpType),
    /// `set_remote_description`
    SetRemote(SdpType),
    /// `rollback`
    Rollback,
    /// `add_ice_candidate`
    AddCandidate(String),
    /// `create_data_channel`
    CreateDataChannel(String),
    /// `close`
    Close,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<PeerId, TransportEventSender>,
    connections: DashMap<(PeerId, PeerId), Arc<MockConnection>>,
    /// Serializes connect checks that span both ends of a pair
    link: Mutex<()>,
}

impl NetworkInner {
    fn notify(&self, endpoint: &PeerId, event: TransportEvent) {
        if let Some(sender) = self.endpoints.get(endpoint) {
            let _ = sender.send(event);
        }
    }

    fn connection(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<MockConnection>> {
        self.connections
            .get(&(local.clone(), remote.clone()))
            .map(|c| c.value().clone())
    }

    /// Connect the pair if both ends are ready, then link pending channels.
    fn try_connect(&self, local: &PeerId, remote: &PeerId) {
        let _link = lock(&self.link);
        let (Some(near), Some(far)) = (self.connection(local, remote), self.connection(remote, local))
        else {
            return;
        };

        let ready = |c: &MockConnection| {
            let state = lock(&c.state);
            !state.closed && state.negotiated && !state.remote_candidates.is_empty()
        };
        let connected = lock(&near.state).connection_state == TransportConnectionState::Connected;
        if !connected {
            if !(ready(&near) && ready(&far)) {
                return;
            }
            for connection in [&near, &far] {
                lock(&connection.state).connection_state = TransportConnectionState::Connected;
                self.notify(
                    &connection.local,
                    TransportEvent::ConnectionState {
                        peer_id: connection.remote.clone(),
                        state: TransportConnectionState::Connected,
                    },
                );
            }
            tracing::debug!("Mock link {} <-> {} connected", local.short(), remote.short());
        }

        self.link_pending(&near, &far);
        self.link_pending(&far, &near);
    }

    fn link_pending(&self, creator: &Arc<MockConnection>, acceptor: &Arc<MockConnection>) {
        let pending = std::mem::take(&mut lock(&creator.state).pending_channels);
        for channel in pending {
            channel.open.store(true, Ordering::SeqCst);
            let inbound = Arc::new(MockDataChannel::new(
                channel.label.clone(),
                acceptor.local.clone(),
                creator.local.clone(),
                Weak::clone(&channel.network),
            ));
            inbound.open.store(true, Ordering::SeqCst);
            lock(&acceptor.state)
                .channels
                .insert(channel.label.clone(), inbound.clone());

            self.notify(
                &acceptor.local,
                TransportEvent::DataChannel {
                    peer_id: creator.local.clone(),
                    channel: inbound,
                },
            );
            self.notify(
                &acceptor.local,
                TransportEvent::ChannelOpen {
                    peer_id: creator.local.clone(),
                    label: channel.label.clone(),
                },
            );
            self.notify(
                &creator.local,
                TransportEvent::ChannelOpen {
                    peer_id: acceptor.local.clone(),
                    label: channel.label.clone(),
                },
            );
        }
    }
}

/// In-memory network shared by every endpoint in a test
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `local` and return its factory plus its transport event stream
    #[must_use]
    pub fn factory(&self, local: &PeerId) -> (MockFactory, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        self.inner.endpoints.insert(local.clone(), events);
        (
            MockFactory {
                network: Arc::downgrade(&self.inner),
            },
            events_rx,
        )
    }

    /// The current connection from `local` to `remote`
    #[must_use]
    pub fn connection(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<MockConnection>> {
        self.inner.connection(local, remote)
    }

    /// Simulate a transport failure on both ends of a pair
    pub fn fail(&self, a: &PeerId, b: &PeerId) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(connection) = self.inner.connection(local, remote) {
                lock(&connection.state).connection_state = TransportConnectionState::Failed;
                self.inner.notify(
                    local,
                    TransportEvent::ConnectionState {
                        peer_id: remote.clone(),
                        state: TransportConnectionState::Failed,
                    },
                );
            }
        }
    }
}

/// [`ConnectionFactory`] for one endpoint of a [`MockNetwork`]
#[derive(Clone)]
pub struct MockFactory {
    network: Weak<NetworkInner>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        _config: &RtcConfig,
    ) -> TransportResult<Arc<dyn RtcConnection>> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Other("network dropped".into()))?;
        let connection = Arc::new(MockConnection {
            local: local.clone(),
            remote: remote.clone(),
            network: Arc::downgrade(&network),
            state: Mutex::new(ConnectionState::default()),
        });
        network
            .connections
            .insert((local.clone(), remote.clone()), connection.clone());
        Ok(connection)
    }
}

struct ConnectionState {
    signaling: SignalingState,
    descriptions: u32,
    candidates: u32,
    negotiated: bool,
    negotiation_requested: bool,
    has_remote: bool,
    remote_candidates: Vec<IceCandidate>,
    applied_remote: Vec<SessionDescription>,
    connection_state: TransportConnectionState,
    pending_channels: Vec<Arc<MockDataChannel>>,
    channels: HashMap<String, Arc<MockDataChannel>>,
    calls: Vec<MockCall>,
    closed: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            descriptions: 0,
            candidates: 0,
            negotiated: false,
            negotiation_requested: false,
            has_remote: false,
            remote_candidates: Vec::new(),
            applied_remote: Vec::new(),
            connection_state: TransportConnectionState::New,
            pending_channels: Vec::new(),
            channels: HashMap::new(),
            calls: Vec::new(),
            closed: false,
        }
    }
}

/// In-memory [`RtcConnection`]
pub struct MockConnection {
    local: PeerId,
    remote: PeerId,
    network: Weak<NetworkInner>,
    state: Mutex<ConnectionState>,
}

impl MockConnection {
    /// Every call made on this connection, in order
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Remote descriptions successfully applied, in order
    #[must_use]
    pub fn applied_remote(&self) -> Vec<SessionDescription> {
        lock(&self.state).applied_remote.clone()
    }

    /// Remote candidates successfully applied, in order
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).remote_candidates.clone()
    }

    /// Current signaling state
    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> TransportConnectionState {
        lock(&self.state).connection_state
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn network(&self) -> TransportResult<Arc<NetworkInner>> {
        self.network
            .upgrade()
            .ok_or_else(|| TransportError::Other("network dropped".into()))
    }

    fn with_open_state<T>(
        &self,
        call: MockCall,
        f: impl FnOnce(&mut ConnectionState) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.closed {
            return Err(TransportError::Closed);
        }
        f(&mut state)
    }

    fn gather_candidate(&self, network: &NetworkInner) {
        let port = {
            let mut state = lock(&self.state);
            state.candidates += 1;
            50_000 + state.candidates
        };
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.local.short(),
                port
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        network.notify(
            &self.local,
            TransportEvent::LocalCandidate {
                peer_id: self.remote.clone(),
                candidate,
            },
        );
    }
}

fn check_sdp(description: &SessionDescription) -> TransportResult<()> {
    let prefix = match description.kind {
        SdpType::Offer => OFFER_PREFIX,
        SdpType::Answer => ANSWER_PREFIX,
    };
    if description.sdp.starts_with(prefix) {
        Ok(())
    } else {
        Err(TransportError::InvalidDescription(format!(
            "unparseable {:?} sdp",
            description.kind
        )))
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.with_open_state(MockCall::CreateOffer, |state| {
            if state.signaling != SignalingState::Stable {
                return Err(TransportError::InvalidState("offer outside stable".into()));
            }
            state.descriptions += 1;
            Ok(SessionDescription::offer(format!(
                "{OFFER_PREFIX}{}:{}",
                self.local, state.descriptions
            )))
        })
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        self.with_open_state(MockCall::CreateAnswer, |state| {
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(TransportError::InvalidState("no remote offer".into()));
            }
            state.descriptions += 1;
            Ok(SessionDescription::answer(format!(
                "{ANSWER_PREFIX}{}:{}",
                self.local, state.descriptions
            )))
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()> {
        let network = self.network()?;
        self.with_open_state(MockCall::SetLocal(description.kind), |state| {
            check_sdp(&description)?;
            match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated = true;
                }
                (kind, current) => {
                    return Err(TransportError::InvalidState(format!(
                        "local {kind:?} in {current:?}"
                    )));
                }
            }
            Ok(())
        })?;

        self.gather_candidate(&network);
        network.try_connect(&self.local, &self.remote);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()> {
        let network = self.network()?;
        self.with_open_state(MockCall::SetRemote(description.kind), |state| {
            check_sdp(&description)?;
            match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated = true;
                }
                (kind, current) => {
                    return Err(TransportError::InvalidState(format!(
                        "remote {kind:?} in {current:?}"
                    )));
                }
            }
            state.has_remote = true;
            state.applied_remote.push(description);
            Ok(())
        })?;

        network.try_connect(&self.local, &self.remote);
        Ok(())
    }

    async fn rollback(&self) -> TransportResult<()> {
        self.with_open_state(MockCall::Rollback, |state| {
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(TransportError::InvalidState("nothing to roll back".into()));
            }
            state.signaling = SignalingState::Stable;
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        let network = self.network()?;
        self.with_open_state(
            MockCall::AddCandidate(candidate.candidate.clone()),
            |state| {
                if !state.has_remote {
                    return Err(TransportError::InvalidCandidate(
                        "no remote description".into(),
                    ));
                }
                state.remote_candidates.push(candidate);
                Ok(())
            },
        )?;

        network.try_connect(&self.local, &self.remote);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn DataChannel>> {
        let network = self.network()?;
        let channel = Arc::new(MockDataChannel::new(
            label.to_string(),
            self.local.clone(),
            self.remote.clone(),
            Arc::downgrade(&network),
        ));

        let request_negotiation =
            self.with_open_state(MockCall::CreateDataChannel(label.to_string()), |state| {
                state.channels.insert(label.to_string(), channel.clone());
                state.pending_channels.push(channel.clone());
                let request = !state.negotiated
                    && !state.negotiation_requested
                    && state.signaling == SignalingState::Stable;
                state.negotiation_requested |= request;
                Ok(request)
            })?;

        if request_negotiation {
            network.notify(
                &self.local,
                TransportEvent::NegotiationNeeded {
                    peer_id: self.remote.clone(),
                },
            );
        }
        network.try_connect(&self.local, &self.remote);
        Ok(channel)
    }

    async fn close(&self) -> TransportResult<()> {
        let channels = {
            let mut state = lock(&self.state);
            state.calls.push(MockCall::Close);
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connection_state = TransportConnectionState::Closed;
            state.pending_channels.clear();
            std::mem::take(&mut state.channels)
        };

        let Some(network) = self.network.upgrade() else {
            return Ok(());
        };
        for channel in channels.values() {
            channel.shut(&network);
        }
        if network.connection(&self.remote, &self.local).is_some() {
            network.notify(
                &self.remote,
                TransportEvent::ConnectionState {
                    peer_id: self.local.clone(),
                    state: TransportConnectionState::Closed,
                },
            );
        }
        Ok(())
    }
}

/// In-memory [`DataChannel`]
pub struct MockDataChannel {
    label: String,
    local: PeerId,
    remote: PeerId,
    open: AtomicBool,
    network: Weak<NetworkInner>,
}

impl MockDataChannel {
    fn new(label: String, local: PeerId, remote: PeerId, network: Weak<NetworkInner>) -> Self {
        Self {
            label,
            local,
            remote,
            open: AtomicBool::new(false),
            network,
        }
    }

    /// Close this end and the remote end, notifying the remote endpoint
    fn shut(&self, network: &NetworkInner) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(remote) = network.connection(&self.remote, &self.local) {
            let counterpart = lock(&remote.state).channels.remove(&self.label);
            if let Some(counterpart) = counterpart {
                counterpart.open.store(false, Ordering::SeqCst);
            }
        }
        network.notify(
            &self.remote,
            TransportEvent::ChannelClosed {
                peer_id: self.local.clone(),
                label: self.label.clone(),
            },
        );
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &str) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let network = self
            .network
            .upgrade()
            .ok_or(TransportError::Closed)?;
        network.notify(
            &self.remote,
            TransportEvent::ChannelMessage {
                peer_id: self.local.clone(),
                label: self.label.clone(),
                data: frame.to_string(),
            },
        );
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if let Some(network) = self.network.upgrade() {
            self.shut(&network);
        }
        Ok(())
    }
}

// ============ Relay ============

#[derive(Default)]
struct RelayInner {
    clients: DashMap<PeerId, mpsc::UnboundedSender<String>>,
    held: Mutex<Option<Vec<(PeerId, String)>>>,
    server: Mutex<Vec<String>>,
}

impl RelayInner {
    fn route(&self, from: &PeerId, raw: String) {
        {
            let mut held = lock(&self.held);
            if let Some(queue) = held.as_mut() {
                queue.push((from.clone(), raw));
                return;
            }
        }
        self.deliver(from, raw);
    }

    fn deliver(&self, from: &PeerId, raw: String) {
        match route_of(&raw) {
            Route::Server => lock(&self.server).push(raw),
            Route::Peer(to) => {
                if let Some(client) = self.clients.get(&to) {
                    let _ = client.send(raw);
                }
            }
            Route::Broadcast => {
                for client in &self.clients {
                    if client.key() != from {
                        let _ = client.value().send(raw.clone());
                    }
                }
            }
        }
    }
}

enum Route {
    Server,
    Peer(PeerId),
    Broadcast,
}

fn route_of(raw: &str) -> Route {
    match SignalingMessage::decode(raw) {
        Ok(SignalingMessage::Challenge {
            to_peer_id: None, ..
        }) => Route::Server,
        Ok(
            SignalingMessage::Challenge {
                to_peer_id: Some(to),
                ..
            }
            | SignalingMessage::PeerId {
                to_peer_id: Some(to),
                ..
            }
            | SignalingMessage::Description { to_peer_id: to, .. }
            | SignalingMessage::Candidate { to_peer_id: to, .. },
        ) => Route::Peer(to),
        Ok(SignalingMessage::PeerId { .. } | SignalingMessage::ClientId { .. }) | Err(_) => {
            Route::Broadcast
        }
    }
}

/// In-memory signaling relay
#[derive(Clone, Default)]
pub struct MockRelay {
    inner: Arc<RelayInner>,
}

impl MockRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `peer_id`. Returns its sink and its inbound message stream.
    #[must_use]
    pub fn connect(&self, peer_id: &PeerId) -> (Arc<MockSignaling>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.clients.insert(peer_id.clone(), tx);
        (
            Arc::new(MockSignaling {
                peer_id: peer_id.clone(),
                relay: Arc::clone(&self.inner),
            }),
            rx,
        )
    }

    /// Send a server identity challenge to `peer_id`
    pub fn greet(&self, peer_id: &PeerId, challenge: &str) {
        let greeting = SignalingMessage::ClientId {
            challenge: challenge.to_string(),
            message: "welcome".to_string(),
        };
        if let (Ok(raw), Some(client)) = (greeting.encode(), self.inner.clients.get(peer_id)) {
            let _ = client.send(raw);
        }
    }

    /// Messages addressed to the server
    #[must_use]
    pub fn server_messages(&self) -> Vec<String> {
        lock(&self.inner.server).clone()
    }

    /// Queue messages instead of delivering them
    pub fn hold(&self) {
        let mut held = lock(&self.inner.held);
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Deliver queued messages in order and resume normal routing
    pub fn release(&self) {
        let queued = lock(&self.inner.held).take().unwrap_or_default();
        for (from, raw) in queued {
            self.inner.deliver(&from, raw);
        }
    }
}

/// [`SignalingSink`] for one relay client
pub struct MockSignaling {
    peer_id: PeerId,
    relay: Arc<RelayInner>,
}

#[async_trait]
impl SignalingSink for MockSignaling {
    async fn send(&self, message: String) -> TransportResult<()> {
        self.relay.route(&self.peer_id, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::{CryptoProvider, NativeProvider};

    fn peer() -> PeerId {
        NativeProvider.generate_keypair().unwrap().peer_id().clone()
    }

    async fn pair() -> (MockNetwork, Arc<dyn RtcConnection>, Arc<dyn RtcConnection>, PeerId, PeerId) {
        let network = MockNetwork::new();
        let (a, b) = (peer(), peer());
        let (fa, _) = network.factory(&a);
        let (fb, _) = network.factory(&b);
        let ca = fa.create(&a, &b, &RtcConfig::default()).await.unwrap();
        let cb = fb.create(&b, &a, &RtcConfig::default()).await.unwrap();
        (network, ca, cb, a, b)
    }

    #[tokio::test]
    async fn test_remote_offer_rejected_with_local_offer() {
        let (_network, ca, cb, _, _) = pair().await;
        let offer_a = ca.create_offer().await.unwrap();
        ca.set_local_description(offer_a).await.unwrap();
        let offer_b = cb.create_offer().await.unwrap();

        assert!(matches!(
            ca.set_remote_description(offer_b).await,
            Err(TransportError::InvalidState(_))
        ));
        ca.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_rejected() {
        let (_network, ca, _, _, _) = pair().await;
        let result = ca.add_ice_candidate(IceCandidate::new("candidate:x")).await;
        assert!(matches!(result, Err(TransportError::InvalidCandidate(_))));
    }

    #[tokio::test]
    async fn test_malformed_sdp_rejected() {
        let (_network, ca, _, _, _) = pair().await;
        let result = ca
            .set_remote_description(SessionDescription::offer("malformed"))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn test_connects_and_links_channels() {
        let network = MockNetwork::new();
        let (a, b) = (peer(), peer());
        let (fa, mut events_a) = network.factory(&a);
        let (fb, mut events_b) = network.factory(&b);
        let ca = fa.create(&a, &b, &RtcConfig::default()).await.unwrap();
        let cb = fb.create(&b, &a, &RtcConfig::default()).await.unwrap();

        let channel = ca.create_data_channel("chat").await.unwrap();
        assert!(!channel.is_open());

        let offer = ca.create_offer().await.unwrap();
        ca.set_local_description(offer.clone()).await.unwrap();
        cb.set_remote_description(offer).await.unwrap();
        let answer = cb.create_answer().await.unwrap();
        cb.set_local_description(answer.clone()).await.unwrap();
        ca.set_remote_description(answer).await.unwrap();
        ca.add_ice_candidate(IceCandidate::new("candidate:b")).await.unwrap();
        cb.add_ice_candidate(IceCandidate::new("candidate:a")).await.unwrap();

        assert!(channel.is_open());
        let mut saw_inbound = false;
        while let Ok(event) = events_b.try_recv() {
            if let TransportEvent::DataChannel { channel, .. } = event {
                assert_eq!(channel.label(), "chat");
                saw_inbound = true;
            }
        }
        assert!(saw_inbound);

        channel.send("frame").await.unwrap();
        let mut delivered = false;
        while let Ok(event) = events_b.try_recv() {
            if let TransportEvent::ChannelMessage { data, .. } = event {
                assert_eq!(data, "frame");
                delivered = true;
            }
        }
        assert!(delivered);

        let mut negotiation_needed = 0;
        while let Ok(event) = events_a.try_recv() {
            if matches!(event, TransportEvent::NegotiationNeeded { .. }) {
                negotiation_needed += 1;
            }
        }
        assert_eq!(negotiation_needed, 1);
    }

    #[tokio::test]
    async fn test_relay_routing() {
        let relay = MockRelay::new();
        let (a, b, c) = (peer(), peer(), peer());
        let (sink_a, mut rx_a) = relay.connect(&a);
        let (_sink_b, mut rx_b) = relay.connect(&b);
        let (_sink_c, mut rx_c) = relay.connect(&c);

        let broadcast = SignalingMessage::PeerId {
            challenge: "c1".into(),
            message: "hi".into(),
            from_peer_id: Some(a.clone()),
            to_peer_id: None,
            room_id: None,
        };
        sink_a.send(broadcast.encode().unwrap()).await.unwrap();
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());

        relay.hold();
        let addressed = SignalingMessage::PeerId {
            challenge: "c2".into(),
            message: "hi".into(),
            from_peer_id: Some(a.clone()),
            to_peer_id: Some(b.clone()),
            room_id: None,
        };
        sink_a.send(addressed.encode().unwrap()).await.unwrap();
        assert!(rx_b.try_recv().is_err());
        relay.release();
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }
}
