//! Events surfaced to the application.

use crate::channel::Message;
use crate::error::PeerError;
use parley_crypto::PeerId;

/// Observable engine event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A peer answered our challenge and is now trusted
    PeerAuthenticated {
        /// Peer
        peer_id: PeerId,
        /// Room the challenge was issued in
        room_id: Option<String>,
    },
    /// The transport reports connectivity with a peer
    PeerConnected {
        /// Peer
        peer_id: PeerId,
    },
    /// A peer was torn down
    PeerClosed {
        /// Peer
        peer_id: PeerId,
        /// Fatal error that caused it; `None` for an orderly disconnect
        reason: Option<PeerError>,
    },
    /// Negotiation failed or timed out; the peer has been torn down
    NegotiationFailed {
        /// Peer
        peer_id: PeerId,
        /// Cause
        error: PeerError,
    },
    /// A data channel opened
    ChannelOpened {
        /// Remote peer
        peer_id: PeerId,
        /// Label
        label: String,
    },
    /// A data channel closed
    ChannelClosed {
        /// Remote peer
        peer_id: PeerId,
        /// Label
        label: String,
    },
    /// An authenticated message arrived
    MessageReceived {
        /// Remote peer
        peer_id: PeerId,
        /// Channel label
        label: String,
        /// Decrypted message
        message: Message,
    },
}

impl EngineEvent {
    /// Peer the event concerns
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::PeerAuthenticated { peer_id, .. }
            | Self::PeerConnected { peer_id }
            | Self::PeerClosed { peer_id, .. }
            | Self::NegotiationFailed { peer_id, .. }
            | Self::ChannelOpened { peer_id, .. }
            | Self::ChannelClosed { peer_id, .. }
            | Self::MessageReceived { peer_id, .. } => peer_id,
        }
    }
}
