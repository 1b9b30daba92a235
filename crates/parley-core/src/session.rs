//! Per-peer session state.
//!
//! A [`PeerSession`] owns everything the engine holds for one remote peer:
//! the native connection, the negotiation state, buffered candidates,
//! channels, the cached channel key and partial reassemblies. The registry
//! wraps each session in a mutex so events for one peer never interleave.

use crate::candidate::{Candidate, CandidateAction, CandidateBuffer};
use crate::channel::{Channel, ChannelState, ChannelTable, Message};
use crate::codec::{Envelope, Reassembler, ReassemblyLimits, SecureCodec};
use crate::error::{PeerError, Result};
use crate::identity::IdentityManager;
use crate::negotiation::{Activity, Negotiator, OfferDecision, Phase, Role, SignalingState};
use crate::signaling::Signaler;
use crate::transport::{
    DataChannel, IceCandidate, RtcConnection, SdpType, SessionDescription, TransportResult,
};
use parley_crypto::{AeadKey, PeerId, PublicKey};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Bound on transport close calls during teardown
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Await a transport call unless the peer is removed first.
pub(crate) async fn cancellable<T>(
    cancel: &watch::Receiver<bool>,
    operation: impl Future<Output = TransportResult<T>>,
) -> Result<T> {
    let mut cancel = cancel.clone();
    tokio::select! {
        biased;
        Ok(_) = cancel.wait_for(|cancelled| *cancelled) => Err(PeerError::Closed),
        result = operation => result.map_err(PeerError::from),
    }
}

fn negotiation_failure(err: PeerError) -> PeerError {
    match err {
        PeerError::Transport(reason) => PeerError::NegotiationFailed(Cow::Owned(reason)),
        other => other,
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// State held for one remote peer
pub struct PeerSession {
    local_peer_id: PeerId,
    peer_id: PeerId,
    public_key: PublicKey,
    room_id: Option<String>,
    negotiator: Negotiator,
    connection: Option<Arc<dyn RtcConnection>>,
    generation: u64,
    candidates: CandidateBuffer,
    channels: ChannelTable,
    key: Option<AeadKey>,
    reassembler: Reassembler,
    cancel: watch::Receiver<bool>,
}

impl PeerSession {
    /// Create an idle session
    #[must_use]
    pub fn new(
        local_peer_id: PeerId,
        peer_id: PeerId,
        public_key: PublicKey,
        room_id: Option<String>,
        limits: ReassemblyLimits,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            negotiator: Negotiator::new(&local_peer_id, &peer_id),
            local_peer_id,
            peer_id,
            public_key,
            room_id,
            connection: None,
            generation: 0,
            candidates: CandidateBuffer::new(),
            channels: ChannelTable::new(),
            key: None,
            reassembler: Reassembler::new(limits),
            cancel,
        }
    }

    /// Remote peer
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Room used for negotiation messages
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Adopt `room_id` if none is set yet
    pub fn adopt_room(&mut self, room_id: &str) {
        if self.room_id.is_none() {
            self.room_id = Some(room_id.to_string());
        }
    }

    /// Negotiation state
    #[must_use]
    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Local role
    #[must_use]
    pub fn role(&self) -> Role {
        self.negotiator.role()
    }

    /// Connection phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.negotiator.phase()
    }

    /// Whether a native connection exists
    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Connection generation, bumped on every new connection
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffered candidates
    #[must_use]
    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    /// Channels
    #[must_use]
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// Whether the channel key has been derived
    #[must_use]
    pub fn has_cached_key(&self) -> bool {
        self.key.is_some()
    }

    /// Partial messages awaiting chunks
    #[must_use]
    pub fn pending_reassemblies(&self) -> usize {
        self.reassembler.pending()
    }

    /// Cancellation signal, set when the peer is removed
    #[must_use]
    pub fn cancel_signal(&self) -> &watch::Receiver<bool> {
        &self.cancel
    }

    /// Install a fresh native connection. Returns its generation.
    pub fn install_connection(&mut self, connection: Arc<dyn RtcConnection>) -> u64 {
        self.negotiator = Negotiator::new(&self.local_peer_id, &self.peer_id);
        self.candidates.clear();
        self.connection = Some(connection);
        self.generation += 1;
        tracing::debug!(
            "Connection #{} created for peer {} ({:?})",
            self.generation,
            self.peer_id.short(),
            self.negotiator.role()
        );
        self.generation
    }

    /// Whether the peer has been removed from the registry
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn connection(&self) -> Result<Arc<dyn RtcConnection>> {
        self.connection
            .clone()
            .ok_or(PeerError::invalid_state("no connection for peer"))
    }

    /// Channel key, derived on first use and cached until removal
    ///
    /// # Errors
    ///
    /// Fails if key agreement rejects the peer's key.
    pub fn channel_key(&mut self, identity: &IdentityManager) -> Result<&AeadKey> {
        let key = match self.key.take() {
            Some(key) => key,
            None => {
                let key = identity.derive_shared_key(&self.public_key)?;
                tracing::debug!("Derived channel key for peer {}", self.peer_id.short());
                key
            }
        };
        Ok(self.key.insert(key))
    }

    // ============ Negotiation ============

    /// Respond to negotiation-needed: create, apply and send an offer.
    ///
    /// Skipped while another description exchange is pending.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NegotiationFailed`] if the transport rejects the
    /// offer; the connection is then closed.
    pub async fn make_offer(&mut self, signaler: &Signaler) -> Result<()> {
        if self.is_cancelled() {
            return Err(PeerError::Closed);
        }
        if self.negotiator.signaling_state() != SignalingState::Stable
            || self.negotiator.activity() != Activity::Quiet
        {
            tracing::debug!(
                "Skipping offer to {}: negotiation in progress",
                self.peer_id.short()
            );
            return Ok(());
        }

        let result = self.make_offer_inner(signaler).await.map_err(negotiation_failure);
        self.close_on_fatal(&result);
        result
    }

    async fn make_offer_inner(&mut self, signaler: &Signaler) -> Result<()> {
        let connection = self.connection()?;
        let room_id = self
            .room_id
            .clone()
            .ok_or(PeerError::invalid_state("peer has no room"))?;
        let cancel = self.cancel.clone();

        let offer = {
            let mut guard = self.negotiator.begin_offer()?;
            let offer = cancellable(&cancel, connection.create_offer()).await?;
            cancellable(&cancel, connection.set_local_description(offer.clone())).await?;
            guard.local_offer_applied();
            offer
        };

        tracing::debug!("Sending offer to {}", self.peer_id.short());
        signaler.send_description(&self.peer_id, &room_id, offer).await
    }

    /// Apply a remote offer or answer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NegotiationFailed`] if the description cannot be
    /// applied; the connection is then closed and must be renegotiated from
    /// scratch.
    pub async fn handle_description(
        &mut self,
        description: SessionDescription,
        signaler: &Signaler,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Err(PeerError::Closed);
        }
        let result = self
            .handle_description_inner(description, signaler)
            .await
            .map_err(negotiation_failure);
        self.close_on_fatal(&result);
        result
    }

    async fn handle_description_inner(
        &mut self,
        description: SessionDescription,
        signaler: &Signaler,
    ) -> Result<()> {
        let connection = self.connection()?;
        let cancel = self.cancel.clone();

        match description.kind {
            SdpType::Offer => {
                match self.negotiator.on_remote_offer() {
                    OfferDecision::Ignore => return Ok(()),
                    OfferDecision::RollbackAndAccept => {
                        cancellable(&cancel, connection.rollback()).await?;
                        self.negotiator.rolled_back();
                    }
                    OfferDecision::Accept => {}
                }

                cancellable(&cancel, connection.set_remote_description(description)).await?;
                self.negotiator.remote_offer_applied();
                self.flush_candidates(&connection).await;

                let answer = cancellable(&cancel, connection.create_answer()).await?;
                cancellable(&cancel, connection.set_local_description(answer.clone())).await?;
                self.negotiator.local_answer_applied();

                let room_id = self
                    .room_id
                    .clone()
                    .ok_or(PeerError::invalid_state("peer has no room"))?;
                tracing::debug!("Sending answer to {}", self.peer_id.short());
                signaler.send_description(&self.peer_id, &room_id, answer).await
            }
            SdpType::Answer => {
                if self.negotiator.signaling_state() != SignalingState::HaveLocalOffer {
                    tracing::debug!(
                        "Ignoring stale answer from {} in {:?}",
                        self.peer_id.short(),
                        self.negotiator.signaling_state()
                    );
                    return Ok(());
                }

                {
                    let mut guard = self.negotiator.begin_remote_answer()?;
                    cancellable(&cancel, connection.set_remote_description(description)).await?;
                    guard.remote_answer_applied();
                }
                self.flush_candidates(&connection).await;
                Ok(())
            }
        }
    }

    fn close_on_fatal(&mut self, result: &Result<()>) {
        if let Err(err) = result {
            if err.is_fatal() {
                let _ = self.negotiator.transition_to(Phase::Closed);
            }
        }
    }

    /// Accept a remote candidate: apply, buffer or drop it.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        let ready = self.connection.is_some() && self.negotiator.has_remote_description();
        let action = self.candidates.add(
            Candidate {
                ice_candidate: candidate,
                with_peer_id: self.peer_id.clone(),
            },
            ready,
            self.negotiator.is_ignoring_offer(),
        );

        match action {
            CandidateAction::Apply(candidate) => {
                if let Ok(connection) = self.connection() {
                    self.apply_candidate(&connection, candidate).await;
                }
            }
            CandidateAction::Buffered => {
                tracing::trace!("Buffered candidate from {}", self.peer_id.short());
            }
            CandidateAction::Dropped => {}
        }
    }

    async fn flush_candidates(&mut self, connection: &Arc<dyn RtcConnection>) {
        for candidate in self.candidates.flush() {
            self.apply_candidate(connection, candidate).await;
        }
    }

    async fn apply_candidate(&self, connection: &Arc<dyn RtcConnection>, candidate: IceCandidate) {
        if let Err(e) = cancellable(&self.cancel, connection.add_ice_candidate(candidate)).await {
            tracing::warn!(
                "Failed to apply candidate from {}: {}",
                self.peer_id.short(),
                e
            );
        }
    }

    /// Record transport connectivity. Returns `true` on the first transition.
    pub fn mark_connected(&mut self) -> bool {
        let was_connected = self.negotiator.phase() == Phase::Connected;
        self.negotiator.transition_to(Phase::Connected).is_ok() && !was_connected
    }

    // ============ Channels ============

    /// Prepare `label` for opening; the creator side creates the data
    /// channel. Returns `true` if this call opened it.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ChannelOpenFailed`] if the transport cannot
    /// create the channel.
    pub async fn open_channel(&mut self, label: &str, room_id: Option<String>) -> Result<bool> {
        let creates = self.negotiator.role().creates_channels();
        let entry = self.channels.prepare(label, room_id, &self.peer_id);
        if entry.channel().state == ChannelState::Open || !creates || entry.handle().is_some() {
            return Ok(false);
        }

        let connection = self.connection()?;
        let handle = cancellable(&self.cancel, connection.create_data_channel(label))
            .await
            .map_err(|e| PeerError::ChannelOpenFailed(Cow::Owned(e.to_string())))?;
        let open = handle.is_open();
        self.channels.attach(handle, None, &self.peer_id);
        Ok(open && self.channels.mark_open(label))
    }

    /// Register an inbound channel. Returns `true` if it is already open.
    pub fn accept_channel(&mut self, handle: Arc<dyn DataChannel>) -> bool {
        let label = handle.label().to_string();
        let open = handle.is_open();
        let room_id = self.room_id.clone();
        self.channels.attach(handle, room_id, &self.peer_id);
        open && self.channels.mark_open(&label)
    }

    /// Transport reports `label` open. Returns `true` on a transition.
    pub fn channel_opened(&mut self, label: &str) -> bool {
        self.channels.mark_open(label)
    }

    /// Transport reports `label` closed. Returns `true` on a transition.
    pub fn channel_closed(&mut self, label: &str) -> bool {
        self.reassembler.forget_channel(label);
        self.channels.mark_closed(label)
    }

    /// Close `label`, optionally dropping its history.
    /// Returns `true` if the channel was not already closed.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ChannelNotFound`] for an unknown label.
    pub async fn close_channel(&mut self, label: &str, delete_messages: bool) -> Result<bool> {
        let handle = self
            .channels
            .get(label)
            .ok_or_else(|| PeerError::ChannelNotFound {
                peer_id: self.peer_id.clone(),
                label: label.to_string(),
            })?
            .handle()
            .cloned();

        if let Some(handle) = handle {
            close_handle(&self.peer_id, handle).await;
        }
        let transitioned = self.channel_closed(label);
        if delete_messages {
            self.channels.remove(label);
        }
        Ok(transitioned)
    }

    /// Close every channel. Returns the labels that were not already closed.
    pub async fn close_all_channels(&mut self) -> Vec<String> {
        let closed = self.channels.close_all();
        let mut labels = Vec::with_capacity(closed.len());
        for (label, handle) in closed {
            if let Some(handle) = handle {
                close_handle(&self.peer_id, handle).await;
            }
            labels.push(label);
        }
        self.reassembler.clear();
        labels
    }

    /// Restore a channel record as closed
    pub fn restore_channel(&mut self, room_id: Option<String>, label: &str) -> &mut Channel {
        self.channels.restore(label, room_id, &self.peer_id)
    }

    // ============ Messaging ============

    /// Encrypt and send `body` on `label`.
    ///
    /// # Errors
    ///
    /// Fails if the channel is unknown or not open, or the transport rejects
    /// a frame.
    pub async fn send(
        &mut self,
        identity: &IdentityManager,
        codec: &SecureCodec,
        label: &str,
        body: &str,
    ) -> Result<Message> {
        let handle = match self.channels.get(label) {
            None => {
                return Err(PeerError::ChannelNotFound {
                    peer_id: self.peer_id.clone(),
                    label: label.to_string(),
                });
            }
            Some(entry) if entry.channel().state != ChannelState::Open => {
                return Err(PeerError::invalid_state("channel is not open"));
            }
            Some(entry) => entry
                .handle()
                .cloned()
                .ok_or(PeerError::invalid_state("channel has no transport"))?,
        };

        let key = self.channel_key(identity)?.clone();
        let id = codec.message_id()?;
        let timestamp = now_millis();
        let frames = codec.seal(&key, &id, &self.local_peer_id, &self.peer_id, timestamp, body)?;

        for frame in &frames {
            let encoded = frame.encode()?;
            cancellable(&self.cancel, handle.send(&encoded)).await?;
        }
        tracing::trace!(
            "Sent message {} to {} on '{}' in {} frames",
            id,
            self.peer_id.short(),
            label,
            frames.len()
        );

        let message = Message {
            id,
            message: body.to_string(),
            from_peer_id: self.local_peer_id.clone(),
            to_peer_id: self.peer_id.clone(),
            timestamp,
        };
        if let Some(entry) = self.channels.get_mut(label) {
            entry.channel_mut().insert(message.clone());
        }
        Ok(message)
    }

    /// Feed one inbound frame. Returns a message once it is complete,
    /// authentic and not a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::DecryptionFailed`] for unauthentic messages and
    /// [`PeerError::Signaling`] for malformed chunks. Neither affects the
    /// channel.
    pub fn receive(
        &mut self,
        identity: &IdentityManager,
        codec: &SecureCodec,
        label: &str,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Option<Message>> {
        if self.channels.get(label).is_none() {
            return Err(PeerError::ChannelNotFound {
                peer_id: self.peer_id.clone(),
                label: label.to_string(),
            });
        }

        self.reassembler.prune(now);
        let Some(sealed) = self.reassembler.accept(label, envelope, now)? else {
            return Ok(None);
        };

        let key = self.channel_key(identity)?.clone();
        let opened = codec.open(&key, &sealed, &self.peer_id, &self.local_peer_id)?;
        let message = Message {
            id: sealed.id,
            message: opened.body,
            from_peer_id: self.peer_id.clone(),
            to_peer_id: self.local_peer_id.clone(),
            timestamp: opened.timestamp,
        };

        let inserted = self
            .channels
            .get_mut(label)
            .is_some_and(|entry| entry.channel_mut().insert(message.clone()));
        Ok(inserted.then_some(message))
    }

    // ============ Teardown ============

    /// Release every resource: channels, connection, candidates, partial
    /// messages and the channel key. Returns the labels of channels that
    /// were open or opening.
    pub async fn shutdown(&mut self) -> Vec<String> {
        let closed = self.close_all_channels().await;

        if let Some(connection) = self.connection.take() {
            match tokio::time::timeout(CLOSE_GRACE, connection.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    "Error closing connection to {}: {}",
                    self.peer_id.short(),
                    e
                ),
                Err(_) => tracing::warn!(
                    "Timed out closing connection to {}",
                    self.peer_id.short()
                ),
            }
        }

        let _ = self.negotiator.transition_to(Phase::Closed);
        self.candidates.clear();
        self.reassembler.clear();
        self.channels.clear();
        // AeadKey zeroizes on drop.
        self.key = None;
        closed
    }
}

async fn close_handle(peer_id: &PeerId, handle: Arc<dyn DataChannel>) {
    match tokio::time::timeout(CLOSE_GRACE, handle.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            "Error closing channel '{}' to {}: {}",
            handle.label(),
            peer_id.short(),
            e
        ),
        Err(_) => tracing::warn!(
            "Timed out closing channel '{}' to {}",
            handle.label(),
            peer_id.short()
        ),
    }
}
