//! Engine orchestration.
//!
//! [`Engine`] ties the pieces together: signaling input runs through the
//! trust gate into per-peer sessions, transport callbacks drive negotiation
//! and channels, and application calls open channels and send messages.
//! Every per-peer step runs under that peer's session lock; fatal errors tear
//! the peer down and surface as [`EngineEvent`]s.

use crate::auth::{TrustGate, Verified};
use crate::channel::{Channel, ChannelState, Message};
use crate::codec::{Envelope, ReassemblyLimits, SecureCodec};
use crate::config::EngineConfig;
use crate::error::{PeerError, Result};
use crate::events::EngineEvent;
use crate::identity::IdentityManager;
use crate::negotiation::{Phase, Role};
use crate::registry::{Peer, PeerEntry, Registry};
use crate::session::{PeerSession, cancellable};
use crate::signaling::{SignalingMessage, Signaler};
use crate::store::{ChannelRecord, MessageRecord, MessageStore, PeerRecord, StoreSnapshot};
use crate::transport::{
    ConnectionFactory, DataChannel, IceCandidate, SessionDescription, SignalingSink,
    TransportConnectionState, TransportEvent,
};
use parley_crypto::{PeerId, PublicKey};
use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;

/// Greeting carried by outgoing `peerId` challenges
const PEER_GREETING: &str = "parley peer challenge";

/// Peer negotiation and secure channel engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    identity: IdentityManager,
    trust: TrustGate,
    registry: Registry,
    codec: SecureCodec,
    signaler: Signaler,
    factory: Arc<dyn ConnectionFactory>,
    store: Arc<dyn MessageStore>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Create an engine.
    ///
    /// Returns the engine and the receiver for its events.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        identity: IdentityManager,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn SignalingSink>,
        store: Arc<dyn MessageStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        config.validate()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let local = identity.peer_id().clone();
        let provider = identity.provider().clone();

        let inner = Inner {
            trust: TrustGate::new(provider.clone()),
            registry: Registry::new(local.clone(), ReassemblyLimits::from(&config.channel)),
            codec: SecureCodec::new(provider, &config.channel),
            signaler: Signaler::new(local.clone(), sink),
            config,
            identity,
            factory,
            store,
            events,
        };

        tracing::info!("Engine started for peer {}", local.short());
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    // ============ Accessors ============

    /// Local peer id
    #[must_use]
    pub fn local_peer_id(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    /// Local public key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.inner.identity.public_key()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Known peer
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.inner.registry.peer(peer_id)
    }

    /// All known peers
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.registry.peers()
    }

    /// Members of a joined room
    #[must_use]
    pub fn peers_in_room(&self, room_id: &str) -> Vec<PeerId> {
        self.inner.registry.peers_in_room(room_id)
    }

    /// Channels of a peer
    pub async fn channels_for_peer(&self, peer_id: &PeerId) -> Vec<Channel> {
        self.inner.registry.channels_for_peer(peer_id).await
    }

    /// One channel of a peer
    pub async fn channel(&self, peer_id: &PeerId, label: &str) -> Option<Channel> {
        let entry = self.inner.registry.get(peer_id)?;
        let session = entry.session().lock().await;
        session.channels().get(label).map(|e| e.channel().clone())
    }

    /// Whether `peer_id` has answered one of our challenges
    #[must_use]
    pub fn is_trusted(&self, peer_id: &PeerId) -> bool {
        self.inner.trust.is_trusted(peer_id)
    }

    /// Whether the channel key for `peer_id` has been derived
    pub async fn has_cached_key(&self, peer_id: &PeerId) -> bool {
        match self.inner.registry.get(peer_id) {
            Some(entry) => entry.session().lock().await.has_cached_key(),
            None => false,
        }
    }

    /// Connection phase with `peer_id`
    pub async fn phase(&self, peer_id: &PeerId) -> Option<Phase> {
        let entry = self.inner.registry.get(peer_id)?;
        let phase = entry.session().lock().await.phase();
        Some(phase)
    }

    /// Local negotiation role towards `peer_id`
    #[must_use]
    pub fn role(&self, peer_id: &PeerId) -> Role {
        Role::for_pair(self.local_peer_id(), peer_id)
    }

    // ============ Rooms ============

    /// Join the room at `url`. Returns its id.
    pub fn join_room(&self, url: &str) -> String {
        self.inner.registry.join_room(url).id().to_string()
    }

    /// Leave a room, tearing down peers that share no other room with us.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::RoomNotFound`] if the room is not joined.
    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        let members = self
            .inner
            .registry
            .leave_room(room_id)
            .ok_or_else(|| PeerError::RoomNotFound(room_id.to_string()))?;

        for member in members {
            if self.inner.registry.rooms_of(&member).is_empty() {
                self.teardown(&member, None).await;
            }
        }
        Ok(())
    }

    /// Announce ourselves in a room with a `peerId` challenge, addressed to
    /// one peer or, with `to = None`, to every member.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::RoomNotFound`] if the room is not joined.
    pub async fn introduce(&self, room_id: &str, to: Option<&PeerId>) -> Result<()> {
        if self.inner.registry.room(room_id).is_none() {
            return Err(PeerError::RoomNotFound(room_id.to_string()));
        }
        self.send_peer_challenge(to, Some(room_id)).await
    }

    async fn send_peer_challenge(&self, to: Option<&PeerId>, room_id: Option<&str>) -> Result<()> {
        let challenge = self.inner.trust.issue(to, room_id)?;
        tracing::debug!(
            "Issuing challenge to {}",
            to.map_or("room", PeerId::short)
        );
        self.inner
            .signaler
            .send(&SignalingMessage::PeerId {
                challenge,
                message: PEER_GREETING.to_string(),
                from_peer_id: Some(self.local_peer_id().clone()),
                to_peer_id: to.cloned(),
                room_id: room_id.map(str::to_string),
            })
            .await
    }

    // ============ Signaling input ============

    /// Process one raw message from the relay.
    ///
    /// # Errors
    ///
    /// Contained errors ([`PeerError::is_contained`]) mean the message was
    /// dropped. Fatal errors have already torn the peer down.
    pub async fn handle_signaling(&self, raw: &str) -> Result<()> {
        let message = SignalingMessage::decode(raw)?;
        tracing::trace!("Signaling in: {}", message.kind());

        match message {
            SignalingMessage::ClientId { challenge, .. } => self.answer_server(&challenge).await,
            SignalingMessage::PeerId {
                challenge,
                from_peer_id,
                to_peer_id,
                room_id,
                ..
            } => {
                let Some(from) = from_peer_id else {
                    return Err(PeerError::signaling("peer challenge without sender"));
                };
                self.on_peer_challenge(&from, to_peer_id.as_ref(), room_id.as_deref(), &challenge)
                    .await
            }
            SignalingMessage::Challenge {
                challenge,
                signature,
                from_peer_id,
                public_key,
                to_peer_id,
                ..
            } => {
                if to_peer_id.as_ref() != Some(self.local_peer_id()) {
                    return Ok(());
                }
                self.on_challenge_response(&from_peer_id, &challenge, &public_key, &signature)
                    .await
            }
            SignalingMessage::Description {
                description,
                from_peer_id,
                to_peer_id,
                room_id,
            } => {
                let Some(entry) = self.admit_negotiation(&from_peer_id, &to_peer_id, &room_id)?
                else {
                    return Ok(());
                };
                self.on_description(&entry, &room_id, description).await
            }
            SignalingMessage::Candidate {
                candidate,
                from_peer_id,
                to_peer_id,
                room_id,
            } => {
                let Some(entry) = self.admit_negotiation(&from_peer_id, &to_peer_id, &room_id)?
                else {
                    return Ok(());
                };
                self.on_candidate(&entry, &room_id, candidate).await
            }
        }
    }

    async fn answer_server(&self, challenge: &str) -> Result<()> {
        tracing::debug!("Answering server challenge");
        self.inner
            .signaler
            .send(&self.challenge_response(challenge, None, None))
            .await
    }

    fn challenge_response(
        &self,
        challenge: &str,
        to: Option<&PeerId>,
        room_id: Option<&str>,
    ) -> SignalingMessage {
        SignalingMessage::Challenge {
            challenge: challenge.to_string(),
            signature: self.inner.identity.sign(challenge.as_bytes()).to_base64(),
            from_peer_id: self.local_peer_id().clone(),
            public_key: *self.public_key(),
            to_peer_id: to.cloned(),
            room_id: room_id.map(str::to_string),
        }
    }

    async fn on_peer_challenge(
        &self,
        from: &PeerId,
        to: Option<&PeerId>,
        room_id: Option<&str>,
        challenge: &str,
    ) -> Result<()> {
        if from == self.local_peer_id() || to.is_some_and(|to| to != self.local_peer_id()) {
            return Ok(());
        }
        if let Some(room_id) = room_id {
            if self.inner.registry.room(room_id).is_none() {
                tracing::debug!(
                    "Ignoring challenge from {} for unknown room",
                    from.short()
                );
                return Ok(());
            }
        }
        if !self.inner.trust.mark_answered(from, challenge) {
            return Ok(());
        }

        self.inner
            .signaler
            .send(&self.challenge_response(challenge, Some(from), room_id))
            .await?;

        if !self.inner.trust.is_trusted(from) && !self.inner.trust.has_outstanding(from) {
            self.send_peer_challenge(Some(from), room_id).await?;
        }
        self.complete_authentication(from, room_id.map(str::to_string));
        Ok(())
    }

    async fn on_challenge_response(
        &self,
        from: &PeerId,
        challenge: &str,
        public_key: &PublicKey,
        signature: &str,
    ) -> Result<()> {
        if self.inner.trust.is_trusted(from) {
            self.inner.trust.discard(challenge);
            return Ok(());
        }

        let verified = match self
            .inner
            .trust
            .verify_response(from, challenge, public_key, signature)
        {
            Ok(verified) => verified,
            Err(e) => {
                tracing::warn!("Rejected challenge response from {}: {}", from.short(), e);
                return Err(e);
            }
        };
        self.admit(verified).await;
        Ok(())
    }

    async fn admit(&self, verified: Verified) {
        let Verified {
            peer_id,
            public_key,
            room_id,
        } = verified;

        let entry = self
            .inner
            .registry
            .add_peer(&peer_id, public_key, room_id.as_deref());
        if let Some(room_id) = room_id.as_deref() {
            entry.session().lock().await.adopt_room(room_id);
        }
        tracing::info!("Peer {} authenticated", peer_id.short());

        let record = PeerRecord {
            id: peer_id.clone(),
            public_key,
            connection_index: entry.peer().connection_index,
        };
        if let Err(e) = self.inner.store.commit_peer(record).await {
            tracing::warn!("Failed to persist peer {}: {}", peer_id.short(), e);
        }
        self.complete_authentication(&peer_id, room_id);
    }

    fn complete_authentication(&self, peer_id: &PeerId, room_id: Option<String>) {
        if self.inner.trust.try_complete(peer_id) {
            self.emit(EngineEvent::PeerAuthenticated {
                peer_id: peer_id.clone(),
                room_id,
            });
        }
    }

    /// Trust gate for negotiation messages. `Ok(None)` means drop silently.
    fn admit_negotiation(
        &self,
        from: &PeerId,
        to: &PeerId,
        room_id: &str,
    ) -> Result<Option<Arc<PeerEntry>>> {
        if !self.inner.trust.is_trusted(from) {
            tracing::warn!("Dropping negotiation message from untrusted {}", from.short());
            return Err(PeerError::authentication("sender is not trusted"));
        }
        if to != self.local_peer_id() || self.inner.registry.room(room_id).is_none() {
            return Ok(None);
        }
        Ok(self.inner.registry.get(from))
    }

    async fn on_description(
        &self,
        entry: &Arc<PeerEntry>,
        room_id: &str,
        description: SessionDescription,
    ) -> Result<()> {
        let result = {
            let mut session = entry.session().lock().await;
            session.adopt_room(room_id);
            match self.ensure_connection(entry, &mut session).await {
                Ok(()) => {
                    session
                        .handle_description(description, &self.inner.signaler)
                        .await
                }
                Err(e) => Err(e),
            }
        };
        self.settle(&entry.peer().id, result).await
    }

    async fn on_candidate(
        &self,
        entry: &Arc<PeerEntry>,
        room_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let result = {
            let mut session = entry.session().lock().await;
            session.adopt_room(room_id);
            match self.ensure_connection(entry, &mut session).await {
                Ok(()) => {
                    session.handle_candidate(candidate).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.settle(&entry.peer().id, result).await
    }

    // ============ Transport input ============

    /// The connection to `peer_id` needs a fresh offer.
    ///
    /// # Errors
    ///
    /// Fatal errors have already torn the peer down.
    pub async fn negotiation_needed(&self, peer_id: &PeerId) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let result = {
            let mut session = entry.session().lock().await;
            if !session.has_connection() {
                return Ok(());
            }
            session.make_offer(&self.inner.signaler).await
        };
        self.settle(peer_id, result).await
    }

    /// A local candidate for `peer_id` was gathered.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Transport`] if the relay is unavailable.
    pub async fn local_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let room_id = entry.session().lock().await.room_id().map(str::to_string);
        let Some(room_id) = room_id else {
            tracing::warn!("No room to signal candidate to {}", peer_id.short());
            return Ok(());
        };
        self.inner
            .signaler
            .send_candidate(peer_id, &room_id, candidate)
            .await
    }

    /// The aggregate connection state for `peer_id` changed.
    pub async fn connection_state_changed(
        &self,
        peer_id: &PeerId,
        state: TransportConnectionState,
    ) -> Result<()> {
        match state {
            TransportConnectionState::Connected => {
                let entry = self.entry(peer_id)?;
                let connected = entry.session().lock().await.mark_connected();
                if connected {
                    tracing::info!("Connected to peer {}", peer_id.short());
                    self.emit(EngineEvent::PeerConnected {
                        peer_id: peer_id.clone(),
                    });
                }
            }
            TransportConnectionState::Failed => {
                tracing::warn!("Connection to {} failed", peer_id.short());
                self.teardown(
                    peer_id,
                    Some(PeerError::Transport("connection failed".to_string())),
                )
                .await;
            }
            TransportConnectionState::Closed => {
                tracing::info!("Connection to {} closed", peer_id.short());
                self.teardown(peer_id, None).await;
            }
            other => tracing::debug!("Connection to {} is {:?}", peer_id.short(), other),
        }
        Ok(())
    }

    /// The remote side of `peer_id` created a data channel.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer.
    pub async fn data_channel(&self, peer_id: &PeerId, channel: Arc<dyn DataChannel>) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let label = channel.label().to_string();
        let opened = entry.session().lock().await.accept_channel(channel);
        tracing::debug!("Inbound channel '{}' from {}", label, peer_id.short());
        if opened {
            self.on_channel_open(&entry, &label).await;
        }
        Ok(())
    }

    /// A channel to `peer_id` opened.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer.
    pub async fn channel_opened(&self, peer_id: &PeerId, label: &str) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let opened = entry.session().lock().await.channel_opened(label);
        if opened {
            self.on_channel_open(&entry, label).await;
        }
        Ok(())
    }

    async fn on_channel_open(&self, entry: &Arc<PeerEntry>, label: &str) {
        let peer_id = &entry.peer().id;
        let room_id = {
            let session = entry.session().lock().await;
            session
                .channels()
                .get(label)
                .and_then(|e| e.channel().room_id.clone())
        };
        tracing::info!("Channel '{}' to {} open", label, peer_id.short());

        let record = ChannelRecord {
            room_id,
            label: label.to_string(),
            with_peer_id: peer_id.clone(),
        };
        if let Err(e) = self.inner.store.commit_channel(record).await {
            tracing::warn!("Failed to persist channel '{}': {}", label, e);
        }
        self.emit(EngineEvent::ChannelOpened {
            peer_id: peer_id.clone(),
            label: label.to_string(),
        });
    }

    /// A channel to `peer_id` closed.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer.
    pub async fn channel_closed(&self, peer_id: &PeerId, label: &str) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let closed = entry.session().lock().await.channel_closed(label);
        if closed {
            tracing::info!("Channel '{}' to {} closed", label, peer_id.short());
            self.emit(EngineEvent::ChannelClosed {
                peer_id: peer_id.clone(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    /// A frame arrived on a channel to `peer_id`.
    ///
    /// # Errors
    ///
    /// Malformed frames and unauthentic messages are dropped and reported as
    /// contained errors; the channel stays open.
    pub async fn channel_message(&self, peer_id: &PeerId, label: &str, data: &str) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let envelope = Envelope::decode(data)?;

        let received = entry.session().lock().await.receive(
            &self.inner.identity,
            &self.inner.codec,
            label,
            envelope,
            Instant::now(),
        );
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    "Dropping message from {} on '{}': {}",
                    peer_id.short(),
                    label,
                    e
                );
                return Err(e);
            }
        };

        self.commit_message(peer_id, label, &message).await;
        self.emit(EngineEvent::MessageReceived {
            peer_id: peer_id.clone(),
            label: label.to_string(),
            message,
        });
        Ok(())
    }

    /// Dispatch one transport callback.
    ///
    /// # Errors
    ///
    /// Propagates the error of the matching input method.
    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::NegotiationNeeded { peer_id } => self.negotiation_needed(&peer_id).await,
            TransportEvent::LocalCandidate { peer_id, candidate } => {
                self.local_candidate(&peer_id, candidate).await
            }
            TransportEvent::ConnectionState { peer_id, state } => {
                self.connection_state_changed(&peer_id, state).await
            }
            TransportEvent::DataChannel { peer_id, channel } => {
                self.data_channel(&peer_id, channel).await
            }
            TransportEvent::ChannelOpen { peer_id, label } => {
                self.channel_opened(&peer_id, &label).await
            }
            TransportEvent::ChannelClosed { peer_id, label } => {
                self.channel_closed(&peer_id, &label).await
            }
            TransportEvent::ChannelMessage {
                peer_id,
                label,
                data,
            } => self.channel_message(&peer_id, &label, &data).await,
        }
    }

    /// Feed relay messages into the engine until the stream ends.
    pub async fn run_signaling(&self, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(raw) = inbound.recv().await {
            if let Err(e) = self.handle_signaling(&raw).await {
                log_input_error("signaling", &e);
            }
        }
        tracing::debug!("Signaling stream ended");
    }

    /// Feed transport callbacks into the engine until the stream ends.
    pub async fn run_transport(&self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            if let Err(e) = self.handle_transport_event(event).await {
                log_input_error("transport", &e);
            }
        }
        tracing::debug!("Transport stream ended");
    }

    // ============ Application operations ============

    /// Start negotiating with a trusted peer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer, or a fatal
    /// negotiation error after tearing the peer down.
    pub async fn connect(&self, peer_id: &PeerId) -> Result<()> {
        if !self.inner.trust.is_trusted(peer_id) {
            return Err(PeerError::authentication("peer is not trusted"));
        }
        let entry = self.entry(peer_id)?;
        let result = {
            let mut session = entry.session().lock().await;
            match self.ensure_connection(&entry, &mut session).await {
                Ok(()) => session.make_offer(&self.inner.signaler).await,
                Err(e) => Err(e),
            }
        };
        self.settle(peer_id, result).await
    }

    /// Open (or reopen) channel `label` to a trusted peer and wait until it
    /// is usable.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ChannelOpenTimeout`] after the configured open
    /// timeout and [`PeerError::ChannelOpenFailed`] if the channel closes or
    /// the peer is removed while waiting.
    pub async fn open_channel(&self, room_id: &str, peer_id: &PeerId, label: &str) -> Result<Channel> {
        if self.inner.registry.room(room_id).is_none() {
            return Err(PeerError::RoomNotFound(room_id.to_string()));
        }
        if !self.inner.trust.is_trusted(peer_id) {
            return Err(PeerError::authentication("peer is not trusted"));
        }
        let entry = self.entry(peer_id)?;

        let (opened, state_rx) = {
            let mut session = entry.session().lock().await;
            session.adopt_room(room_id);
            if let Err(e) = self.ensure_connection(&entry, &mut session).await {
                drop(session);
                self.settle(peer_id, Err(e.clone())).await?;
                return Err(e);
            }
            let opened = session
                .open_channel(label, Some(room_id.to_string()))
                .await?;
            let state_rx = session
                .channels()
                .get(label)
                .map(|e| e.subscribe())
                .ok_or_else(|| PeerError::ChannelOpenFailed(Cow::Borrowed("channel vanished")))?;
            (opened, state_rx)
        };
        if opened {
            self.on_channel_open(&entry, label).await;
        }

        let mut state_rx = state_rx;
        let mut cancelled = entry.cancelled();
        let wait = async {
            tokio::select! {
                state = state_rx.wait_for(|s| *s != ChannelState::Opening) => {
                    state.map(|s| *s).unwrap_or(ChannelState::Closed)
                }
                _ = cancelled.wait_for(|c| *c) => ChannelState::Closed,
            }
        };

        match tokio::time::timeout(self.inner.config.channel.open_timeout, wait).await {
            Ok(ChannelState::Open) => {}
            Ok(_) => {
                return Err(PeerError::ChannelOpenFailed(Cow::Borrowed(
                    "channel closed while opening",
                )));
            }
            Err(_) => {
                tracing::warn!("Channel '{}' to {} timed out opening", label, peer_id.short());
                let closed = entry.session().lock().await.close_channel(label, false).await;
                if matches!(closed, Ok(true)) {
                    self.emit(EngineEvent::ChannelClosed {
                        peer_id: peer_id.clone(),
                        label: label.to_string(),
                    });
                }
                return Err(PeerError::ChannelOpenTimeout(label.to_string()));
            }
        }

        if entry.is_cancelled() {
            return Err(PeerError::ChannelOpenFailed(Cow::Borrowed("peer removed")));
        }
        let session = entry.session().lock().await;
        session
            .channels()
            .get(label)
            .map(|e| e.channel().clone())
            .ok_or(PeerError::ChannelOpenFailed(Cow::Borrowed("peer removed")))
    }

    /// Encrypt and send `body` to `peer_id` on `label`.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown or not open, or the transport rejects
    /// a frame.
    pub async fn send(&self, peer_id: &PeerId, label: &str, body: &str) -> Result<Message> {
        let entry = self.entry(peer_id)?;
        let message = entry
            .session()
            .lock()
            .await
            .send(&self.inner.identity, &self.inner.codec, label, body)
            .await?;
        self.commit_message(peer_id, label, &message).await;
        Ok(message)
    }

    /// Close one channel, optionally purging its history.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] or [`PeerError::ChannelNotFound`].
    pub async fn close_channel(&self, peer_id: &PeerId, label: &str, delete_messages: bool) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let closed = entry
            .session()
            .lock()
            .await
            .close_channel(label, delete_messages)
            .await?;

        if delete_messages {
            if let Err(e) = self
                .inner
                .store
                .delete_channel_messages(peer_id, label)
                .await
            {
                tracing::warn!("Failed to purge channel '{}': {}", label, e);
            }
        }
        if closed {
            self.emit(EngineEvent::ChannelClosed {
                peer_id: peer_id.clone(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    /// Close every channel of `peer_id`; the connection stays up.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer.
    pub async fn close_all_for_peer(&self, peer_id: &PeerId) -> Result<()> {
        let entry = self.entry(peer_id)?;
        let closed = entry.session().lock().await.close_all_channels().await;
        for label in closed {
            self.emit(EngineEvent::ChannelClosed {
                peer_id: peer_id.clone(),
                label,
            });
        }
        Ok(())
    }

    /// Close every channel of every peer.
    pub async fn close_all(&self) {
        for peer in self.inner.registry.peers() {
            let _ = self.close_all_for_peer(&peer.id).await;
        }
    }

    /// Disconnect and forget `peer_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::PeerNotFound`] for an unknown peer.
    pub async fn disconnect(&self, peer_id: &PeerId) -> Result<()> {
        if self.teardown(peer_id, None).await {
            Ok(())
        } else {
            Err(PeerError::PeerNotFound(peer_id.clone()))
        }
    }

    /// Replay a store snapshot. Restored peers are untrusted until they
    /// authenticate again; restored channels are closed.
    ///
    /// Returns the number of messages restored.
    pub async fn restore(&self, snapshot: StoreSnapshot) -> usize {
        for record in snapshot.peers {
            if !record.id.matches(&record.public_key) {
                tracing::warn!("Skipping stored peer {} with mismatched key", record.id.short());
                continue;
            }
            self.inner
                .registry
                .restore_peer(&record.id, record.public_key, record.connection_index);
        }

        for record in snapshot.channels {
            let Some(entry) = self.inner.registry.get(&record.with_peer_id) else {
                continue;
            };
            entry
                .session()
                .lock()
                .await
                .restore_channel(record.room_id, &record.label);
        }

        let mut restored = 0;
        for record in snapshot.messages {
            let Some(entry) = self.inner.registry.get(&record.with_peer_id) else {
                continue;
            };
            let mut session = entry.session().lock().await;
            if session
                .restore_channel(None, &record.label)
                .insert(record.message)
            {
                restored += 1;
            }
        }

        tracing::info!(
            "Restored {} peers and {} messages",
            self.inner.registry.len(),
            restored
        );
        restored
    }

    // ============ Internals ============

    fn entry(&self, peer_id: &PeerId) -> Result<Arc<PeerEntry>> {
        self.inner
            .registry
            .get(peer_id)
            .ok_or_else(|| PeerError::PeerNotFound(peer_id.clone()))
    }

    fn emit(&self, event: EngineEvent) {
        // The application may have dropped the receiver.
        let _ = self.inner.events.send(event);
    }

    async fn commit_message(&self, peer_id: &PeerId, label: &str, message: &Message) {
        let record = MessageRecord {
            with_peer_id: peer_id.clone(),
            label: label.to_string(),
            message: message.clone(),
        };
        if let Err(e) = self.inner.store.commit_message(record).await {
            tracing::warn!("Failed to persist message {}: {}", message.id, e);
        }
    }

    async fn ensure_connection(&self, entry: &Arc<PeerEntry>, session: &mut PeerSession) -> Result<()> {
        // A removed peer's session is shut down for good.
        if entry.is_cancelled() {
            return Err(PeerError::Closed);
        }
        if session.has_connection() {
            return Ok(());
        }
        let peer_id = &entry.peer().id;
        let connection = cancellable(
            session.cancel_signal(),
            self.inner
                .factory
                .create(self.local_peer_id(), peer_id, &self.inner.config.rtc),
        )
        .await?;

        let generation = session.install_connection(connection);
        self.spawn_watchdog(entry, generation);
        Ok(())
    }

    fn spawn_watchdog(&self, entry: &Arc<PeerEntry>, generation: u64) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let peer_id = entry.peer().id.clone();
        let mut cancelled = entry.cancelled();
        let timeout = self.inner.config.negotiation.timeout;

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {}
                _ = cancelled.wait_for(|c| *c) => return,
            }
            if let Some(inner) = inner.upgrade() {
                Engine { inner }.negotiation_deadline(&peer_id, generation).await;
            }
        });
    }

    async fn negotiation_deadline(&self, peer_id: &PeerId, generation: u64) {
        let Some(entry) = self.inner.registry.get(peer_id) else {
            return;
        };
        let expired = {
            let session = entry.session().lock().await;
            session.generation() == generation
                && matches!(session.phase(), Phase::Idle | Phase::Negotiating)
        };
        if expired {
            tracing::warn!("Negotiation with {} timed out", peer_id.short());
            self.fail_peer(peer_id, PeerError::NegotiationTimeout(peer_id.clone()))
                .await;
        }
    }

    /// Tear the peer down on fatal errors; pass everything through.
    async fn settle(&self, peer_id: &PeerId, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail_peer(peer_id, e.clone()).await;
            }
        }
        result
    }

    async fn fail_peer(&self, peer_id: &PeerId, error: PeerError) {
        tracing::warn!("Negotiation with {} failed: {}", peer_id.short(), error);
        self.emit(EngineEvent::NegotiationFailed {
            peer_id: peer_id.clone(),
            error: error.clone(),
        });
        self.teardown(peer_id, Some(error)).await;
    }

    /// Remove `peer_id` everywhere. Returns `false` if it was unknown.
    async fn teardown(&self, peer_id: &PeerId, reason: Option<PeerError>) -> bool {
        self.inner.trust.revoke(peer_id);
        let Some(removed) = self.inner.registry.remove_peer(peer_id).await else {
            return false;
        };

        for label in removed.closed_channels {
            self.emit(EngineEvent::ChannelClosed {
                peer_id: peer_id.clone(),
                label,
            });
        }
        tracing::info!("Peer {} closed", peer_id.short());
        self.emit(EngineEvent::PeerClosed {
            peer_id: peer_id.clone(),
            reason,
        });
        true
    }
}

fn log_input_error(source: &str, error: &PeerError) {
    if error.is_contained() {
        tracing::debug!("Dropped {} input: {}", source, error);
    } else {
        tracing::warn!("Error handling {} input: {}", source, error);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("peer_id", self.local_peer_id())
            .field("peers", &self.inner.registry.len())
            .field("rooms", &self.inner.registry.rooms().len())
            .finish_non_exhaustive()
    }
}
