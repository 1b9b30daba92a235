//! Perfect negotiation state machine.
//!
//! Either side of a peer pair may start an offer at any time. When both do at
//! once (glare), the pair's fixed roles decide the outcome: the impolite side
//! keeps its offer and ignores the incoming one, the polite side rolls its
//! own offer back and answers.
//!
//! ```text
//!  Impolite (A)                        Polite (B)
//!      |  offer(A) ---------\   /--------- offer(B)  |
//!      |                     \ /                     |
//!      |                      X                      |
//!      |  ignore offer(B) <--/ \--> rollback, accept |
//!      |                              offer(A)       |
//!      |  <------------------------- answer(B)       |
//!      |         [single connection, A's offer]      |
//! ```
//!
//! The negotiator only tracks state and decides; the session performs the
//! transport calls and reports each completed step back.

use crate::error::{PeerError, Result};
use parley_crypto::PeerId;
use std::ops::{Deref, DerefMut};

/// Glare-resolution role, fixed for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Yields on collision; the remote side creates data channels
    Polite,
    /// Wins on collision; creates data channels
    Impolite,
}

impl Role {
    /// Both sides compute the same assignment: the smaller peer id is polite.
    #[must_use]
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> Self {
        if local < remote {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    /// Whether this side creates outbound data channels
    #[must_use]
    pub fn creates_channels(self) -> bool {
        self == Role::Impolite
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No description exchanged yet
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Transport reports connectivity
    Connected,
    /// Terminal
    Closed,
}

/// Offer/answer signaling state of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No description pending
    Stable,
    /// Local offer applied, awaiting answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
}

/// In-flight negotiation work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Nothing in flight
    Quiet,
    /// Creating and applying a local offer
    MakingOffer,
    /// Applying a remote answer
    ApplyingRemoteAnswer,
}

/// Outcome of receiving a remote offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// No collision; apply it
    Accept,
    /// Collision on the polite side: roll back the local offer, then apply
    RollbackAndAccept,
    /// Collision on the impolite side: drop it and its candidates
    Ignore,
}

/// Per-connection negotiation state
#[derive(Debug)]
pub struct Negotiator {
    with_peer_id: PeerId,
    role: Role,
    phase: Phase,
    signaling: SignalingState,
    activity: Activity,
    ignore_offer: bool,
    remote_description_applied: bool,
}

impl Negotiator {
    /// Create the state for a new connection to `remote`
    #[must_use]
    pub fn new(local: &PeerId, remote: &PeerId) -> Self {
        Self {
            with_peer_id: remote.clone(),
            role: Role::for_pair(local, remote),
            phase: Phase::Idle,
            signaling: SignalingState::Stable,
            activity: Activity::Quiet,
            ignore_offer: false,
            remote_description_applied: false,
        }
    }

    /// Local role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// True when the remote side creates data channels
    #[must_use]
    pub fn peer_is_initiator(&self) -> bool {
        self.role == Role::Polite
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current signaling state
    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    /// Current activity
    #[must_use]
    pub fn activity(&self) -> Activity {
        self.activity
    }

    /// Whether a colliding offer is currently being ignored
    #[must_use]
    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    /// Whether any remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_applied
    }

    /// Check whether a phase transition is valid
    #[must_use]
    pub fn can_transition(&self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self.phase, to),
            (Idle, Negotiating)
                | (Idle, Connected)
                | (Negotiating, Connected)
                | (Idle | Negotiating | Connected, Closed)
        )
    }

    /// Move to another phase.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] for transitions the lifecycle
    /// does not allow (anything out of `Closed`).
    pub fn transition_to(&mut self, to: Phase) -> Result<()> {
        if self.phase == to {
            return Ok(());
        }
        if !self.can_transition(to) {
            return Err(PeerError::invalid_state("invalid phase transition"));
        }

        let from = self.phase;
        self.phase = to;
        if to == Phase::Closed {
            self.activity = Activity::Quiet;
            self.ignore_offer = false;
        }

        tracing::debug!(
            "Peer {} phase transition: {:?} -> {:?}",
            self.with_peer_id.short(),
            from,
            to
        );
        Ok(())
    }

    /// Enter `MakingOffer` for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] if the connection is closed, other
    /// negotiation work is in flight, or a description is already pending.
    pub fn begin_offer(&mut self) -> Result<ActivityGuard<'_>> {
        if self.phase == Phase::Closed {
            return Err(PeerError::Closed);
        }
        if self.activity != Activity::Quiet {
            return Err(PeerError::invalid_state("negotiation already in progress"));
        }
        if self.signaling != SignalingState::Stable {
            return Err(PeerError::invalid_state("offer already pending"));
        }
        Ok(ActivityGuard::enter(self, Activity::MakingOffer))
    }

    /// Enter `ApplyingRemoteAnswer` for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidState`] unless a local offer is awaiting
    /// its answer and nothing else is in flight.
    pub fn begin_remote_answer(&mut self) -> Result<ActivityGuard<'_>> {
        if self.phase == Phase::Closed {
            return Err(PeerError::Closed);
        }
        if self.signaling != SignalingState::HaveLocalOffer || self.activity != Activity::Quiet {
            return Err(PeerError::invalid_state("no local offer awaiting an answer"));
        }
        Ok(ActivityGuard::enter(self, Activity::ApplyingRemoteAnswer))
    }

    /// Decide what to do with an incoming offer and record the decision.
    pub fn on_remote_offer(&mut self) -> OfferDecision {
        let ready_for_offer = self.activity != Activity::MakingOffer
            && (self.signaling == SignalingState::Stable
                || self.activity == Activity::ApplyingRemoteAnswer);
        let collision = !ready_for_offer;

        self.ignore_offer = collision && self.role == Role::Impolite;

        if self.ignore_offer {
            tracing::info!(
                "Glare with {}: keeping local offer, ignoring remote offer",
                self.with_peer_id.short()
            );
            OfferDecision::Ignore
        } else if collision {
            tracing::info!(
                "Glare with {}: rolling back local offer",
                self.with_peer_id.short()
            );
            OfferDecision::RollbackAndAccept
        } else {
            OfferDecision::Accept
        }
    }

    /// The local offer was rolled back
    pub fn rolled_back(&mut self) {
        self.set_signaling(SignalingState::Stable);
    }

    /// A local offer was applied
    pub fn local_offer_applied(&mut self) {
        self.set_signaling(SignalingState::HaveLocalOffer);
        self.enter_negotiating();
    }

    /// A remote offer was applied
    pub fn remote_offer_applied(&mut self) {
        self.remote_description_applied = true;
        self.ignore_offer = false;
        self.set_signaling(SignalingState::HaveRemoteOffer);
        self.enter_negotiating();
    }

    /// The local answer was applied
    pub fn local_answer_applied(&mut self) {
        self.set_signaling(SignalingState::Stable);
    }

    /// The remote answer was applied
    pub fn remote_answer_applied(&mut self) {
        self.remote_description_applied = true;
        self.ignore_offer = false;
        self.set_signaling(SignalingState::Stable);
    }

    fn enter_negotiating(&mut self) {
        // Renegotiation on a live connection stays Connected.
        if self.phase == Phase::Idle {
            let _ = self.transition_to(Phase::Negotiating);
        }
    }

    fn set_signaling(&mut self, state: SignalingState) {
        if self.signaling != state {
            tracing::debug!(
                "Peer {} signaling state: {:?} -> {:?}",
                self.with_peer_id.short(),
                self.signaling,
                state
            );
            self.signaling = state;
        }
    }
}

/// Scoped negotiation activity.
///
/// Resets the negotiator to [`Activity::Quiet`] when dropped, on success,
/// error, or cancellation of the enclosing future alike.
pub struct ActivityGuard<'a> {
    negotiator: &'a mut Negotiator,
}

impl<'a> ActivityGuard<'a> {
    fn enter(negotiator: &'a mut Negotiator, activity: Activity) -> Self {
        negotiator.activity = activity;
        Self { negotiator }
    }
}

impl Deref for ActivityGuard<'_> {
    type Target = Negotiator;

    fn deref(&self) -> &Negotiator {
        self.negotiator
    }
}

impl DerefMut for ActivityGuard<'_> {
    fn deref_mut(&mut self) -> &mut Negotiator {
        self.negotiator
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.negotiator.activity = Activity::Quiet;
    }
}
