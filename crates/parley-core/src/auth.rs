//! Trust gate.
//!
//! Negotiation messages from a peer reach the state machine only after that
//! peer has answered one of our challenges with a valid signature from a key
//! that hashes to its claimed id. The gate owns the issued challenges and the
//! verified keys; nothing else decides trust.

use crate::error::{PeerError, Result};
use dashmap::{DashMap, DashSet};
use parley_crypto::{CryptoProvider, PeerId, PublicKey, Signature};
use std::sync::Arc;

/// Challenge length in random bytes (hex encoded on the wire)
pub const CHALLENGE_BYTES: usize = 32;

/// An outstanding challenge
#[derive(Debug, Clone)]
struct Issued {
    /// Addressee; `None` for room-wide announcements any peer may answer
    to: Option<PeerId>,
    room_id: Option<String>,
}

/// Result of a successful challenge verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// Authenticated peer
    pub peer_id: PeerId,
    /// Its public key
    pub public_key: PublicKey,
    /// Room the challenge was issued in
    pub room_id: Option<String>,
}

/// Challenge issuance and trust bookkeeping
pub struct TrustGate {
    provider: Arc<dyn CryptoProvider>,
    issued: DashMap<String, Issued>,
    trusted: DashMap<PeerId, PublicKey>,
    /// Challenges from each peer we have already answered
    answered: DashSet<(PeerId, String)>,
    /// Peers for which authentication has been reported
    completed: DashSet<PeerId>,
}

impl TrustGate {
    /// Create an empty gate
    #[must_use]
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            issued: DashMap::new(),
            trusted: DashMap::new(),
            answered: DashSet::new(),
            completed: DashSet::new(),
        }
    }

    /// Issue a fresh challenge, optionally addressed to one peer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::CryptoUnavailable`] without secure randomness.
    pub fn issue(&self, to: Option<&PeerId>, room_id: Option<&str>) -> Result<String> {
        let mut raw = [0u8; CHALLENGE_BYTES];
        self.provider.fill_random(&mut raw)?;
        let challenge = hex::encode(raw);

        self.issued.insert(
            challenge.clone(),
            Issued {
                to: to.cloned(),
                room_id: room_id.map(str::to_string),
            },
        );
        Ok(challenge)
    }

    /// Check a challenge response and trust the responder on success.
    ///
    /// Accepted only if `challenge` is one we issued (to `from`, or to
    /// anyone), `public_key` hashes to `from`, and `signature` verifies.
    /// Addressed challenges are consumed; room-wide ones stay valid for other
    /// responders.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::AuthenticationFailed`] and leaves the gate
    /// unchanged on any mismatch.
    pub fn verify_response(
        &self,
        from: &PeerId,
        challenge: &str,
        public_key: &PublicKey,
        signature: &str,
    ) -> Result<Verified> {
        let issued = self
            .issued
            .get(challenge)
            .map(|entry| entry.value().clone())
            .ok_or(PeerError::authentication("unknown challenge"))?;

        if issued.to.as_ref().is_some_and(|to| to != from) {
            return Err(PeerError::authentication("challenge issued to another peer"));
        }
        if !from.matches(public_key) {
            return Err(PeerError::authentication("public key does not match peer id"));
        }

        let signature = Signature::from_base64(signature)
            .map_err(|_| PeerError::authentication("malformed signature"))?;
        if !self
            .provider
            .verify(public_key, challenge.as_bytes(), &signature)
        {
            return Err(PeerError::authentication("invalid signature"));
        }

        if issued.to.is_some() {
            self.issued.remove(challenge);
        }
        self.trusted.insert(from.clone(), *public_key);

        Ok(Verified {
            peer_id: from.clone(),
            public_key: *public_key,
            room_id: issued.room_id,
        })
    }

    /// Whether `peer` has been authenticated this session
    #[must_use]
    pub fn is_trusted(&self, peer: &PeerId) -> bool {
        self.trusted.contains_key(peer)
    }

    /// Verified public key of a trusted peer
    #[must_use]
    pub fn trusted_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.trusted.get(peer).map(|entry| *entry.value())
    }

    /// Whether we have an unanswered challenge addressed to `peer`
    #[must_use]
    pub fn has_outstanding(&self, peer: &PeerId) -> bool {
        self.issued
            .iter()
            .any(|entry| entry.value().to.as_ref() == Some(peer))
    }

    /// Record that we answered `challenge` from `peer`.
    ///
    /// Returns `false` if it was already answered.
    pub fn mark_answered(&self, peer: &PeerId, challenge: &str) -> bool {
        self.answered.insert((peer.clone(), challenge.to_string()))
    }

    /// Whether we have answered any challenge from `peer`
    #[must_use]
    pub fn has_answered(&self, peer: &PeerId) -> bool {
        self.answered.iter().any(|entry| &entry.key().0 == peer)
    }

    /// Drop an outstanding challenge without verifying it
    pub fn discard(&self, challenge: &str) {
        self.issued.remove(challenge);
    }

    /// Mark authentication with `peer` complete once it is trusted and we
    /// have answered one of its challenges.
    ///
    /// Returns `true` exactly once per trust period. Our answer is already
    /// sent by then, ahead of any negotiation message to that peer.
    pub fn try_complete(&self, peer: &PeerId) -> bool {
        self.is_trusted(peer) && self.has_answered(peer) && self.completed.insert(peer.clone())
    }

    /// Forget everything about `peer`
    pub fn revoke(&self, peer: &PeerId) {
        self.trusted.remove(peer);
        self.completed.remove(peer);
        self.issued
            .retain(|_, issued| issued.to.as_ref() != Some(peer));
        self.answered.retain(|(answered_peer, _)| answered_peer != peer);
        tracing::debug!("Revoked trust for peer {}", peer.short());
    }

    /// Number of trusted peers
    #[must_use]
    pub fn trusted_count(&self) -> usize {
        self.trusted.len()
    }
}
