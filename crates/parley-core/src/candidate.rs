//! Candidate buffering.
//!
//! Remote candidates can arrive before the description they belong to. The
//! buffer holds them in arrival order until a remote description has been
//! applied, then releases them exactly once.

use crate::transport::IceCandidate;
use parley_crypto::PeerId;
use std::collections::HashSet;

/// A remote candidate addressed to one peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Connectivity candidate
    pub ice_candidate: IceCandidate,
    /// Remote peer it came from
    pub with_peer_id: PeerId,
}

/// What the caller must do with a candidate passed to [`CandidateBuffer::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAction {
    /// Apply to the connection now
    Apply(IceCandidate),
    /// Held until the next flush
    Buffered,
    /// Discarded: duplicate, or belongs to an ignored offer
    Dropped,
}

/// Insertion-ordered candidate buffer for one peer
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<Candidate>,
    /// Every candidate ever released, so none is applied twice
    released: HashSet<IceCandidate>,
}

impl CandidateBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a candidate. Never fails.
    ///
    /// `remote_description_applied` reflects the owning connection;
    /// `ignoring_offer` is set while a colliding remote offer is being ignored.
    pub fn add(
        &mut self,
        candidate: Candidate,
        remote_description_applied: bool,
        ignoring_offer: bool,
    ) -> CandidateAction {
        if ignoring_offer {
            tracing::debug!(
                "Dropping candidate from {} (offer ignored)",
                candidate.with_peer_id.short()
            );
            return CandidateAction::Dropped;
        }

        if self.released.contains(&candidate.ice_candidate)
            || self
                .pending
                .iter()
                .any(|c| c.ice_candidate == candidate.ice_candidate)
        {
            return CandidateAction::Dropped;
        }

        if remote_description_applied {
            self.released.insert(candidate.ice_candidate.clone());
            return CandidateAction::Apply(candidate.ice_candidate);
        }

        self.pending.push(candidate);
        CandidateAction::Buffered
    }

    /// Drain every buffered candidate in arrival order.
    ///
    /// Call only after a remote description was applied successfully.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        let drained: Vec<IceCandidate> = self
            .pending
            .drain(..)
            .map(|c| c.ice_candidate)
            .filter(|c| self.released.insert(c.clone()))
            .collect();

        if !drained.is_empty() {
            tracing::debug!("Flushing {} buffered candidates", drained.len());
        }
        drained
    }

    /// Remove buffered entries by position without flushing.
    ///
    /// Out-of-range indexes are ignored. Returns the number removed.
    pub fn delete_candidates(&mut self, indexes: &[usize]) -> usize {
        let doomed: HashSet<usize> = indexes
            .iter()
            .copied()
            .filter(|&i| i < self.pending.len())
            .collect();

        let mut position = 0;
        self.pending.retain(|_| {
            let keep = !doomed.contains(&position);
            position += 1;
            keep
        });
        doomed.len()
    }

    /// Buffered candidates, oldest first
    #[must_use]
    pub fn pending(&self) -> &[Candidate] {
        &self.pending
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Discard everything, including the released history
    pub fn clear(&mut self) {
        self.pending.clear();
        self.released.clear();
    }
}
