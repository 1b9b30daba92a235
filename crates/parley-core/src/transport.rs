//! Peer-connection transport abstraction.
//!
//! The engine orchestrates an existing peer-connection implementation (ICE,
//! DTLS and SCTP live below this boundary). Connections are created through a
//! [`ConnectionFactory`]; callbacks from the transport (negotiation needed,
//! local candidates, connection state, inbound channels and frames) are fed
//! back into the engine as [`TransportEvent`]s.

use crate::config::RtcConfig;
use async_trait::async_trait;
use parley_crypto::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport layer errors. Fatal for the connection that raised them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection or channel is closed
    #[error("Transport is closed")]
    Closed,

    /// Description rejected by the transport
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Operation not allowed in the current signaling state
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    /// Candidate rejected by the transport
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for crate::PeerError {
    fn from(err: TransportError) -> Self {
        crate::PeerError::Transport(err.to_string())
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Opaque SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Aggregate connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectionState {
    /// Created, no connectivity checks yet
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Media and data can flow
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Connectivity failed permanently
    Failed,
    /// Connection closed
    Closed,
}

impl TransportConnectionState {
    /// Whether the connection can never recover from this state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Factory for native peer connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection from `local` to `remote`.
    ///
    /// # Errors
    /// Returns `TransportError` if the platform cannot create a connection
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        config: &RtcConfig,
    ) -> TransportResult<Arc<dyn RtcConnection>>;
}

/// Native peer connection
///
/// Signaling-state rules are enforced by the implementation: applying a
/// remote offer while holding a local offer fails, as does adding a candidate
/// before any remote description.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Create an offer
    async fn create_offer(&self) -> TransportResult<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> TransportResult<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()>;

    /// Discard the applied local offer and return to stable
    async fn rollback(&self) -> TransportResult<()>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;

    /// Create an outbound data channel
    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn DataChannel>>;

    /// Close the connection and every channel on it
    async fn close(&self) -> TransportResult<()>;
}

/// Bidirectional text data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether frames can currently be sent
    fn is_open(&self) -> bool;

    /// Send one text frame
    async fn send(&self, frame: &str) -> TransportResult<()>;

    /// Close the channel
    async fn close(&self) -> TransportResult<()>;
}

/// Callback from the transport, delivered to the engine in order.
#[derive(Clone)]
pub enum TransportEvent {
    /// The connection wants a fresh offer
    NegotiationNeeded {
        /// Remote peer
        peer_id: PeerId,
    },
    /// A local candidate was gathered and must be signaled
    LocalCandidate {
        /// Remote peer
        peer_id: PeerId,
        /// Gathered candidate
        candidate: IceCandidate,
    },
    /// Aggregate connection state changed
    ConnectionState {
        /// Remote peer
        peer_id: PeerId,
        /// New state
        state: TransportConnectionState,
    },
    /// The remote side created a data channel
    DataChannel {
        /// Remote peer
        peer_id: PeerId,
        /// Inbound channel
        channel: Arc<dyn DataChannel>,
    },
    /// A channel became open
    ChannelOpen {
        /// Remote peer
        peer_id: PeerId,
        /// Channel label
        label: String,
    },
    /// A channel closed
    ChannelClosed {
        /// Remote peer
        peer_id: PeerId,
        /// Channel label
        label: String,
    },
    /// A text frame arrived on a channel
    ChannelMessage {
        /// Remote peer
        peer_id: PeerId,
        /// Channel label
        label: String,
        /// Raw frame
        data: String,
    },
}

impl TransportEvent {
    /// Remote peer the event concerns
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::NegotiationNeeded { peer_id }
            | Self::LocalCandidate { peer_id, .. }
            | Self::ConnectionState { peer_id, .. }
            | Self::DataChannel { peer_id, .. }
            | Self::ChannelOpen { peer_id, .. }
            | Self::ChannelClosed { peer_id, .. }
            | Self::ChannelMessage { peer_id, .. } => peer_id,
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegotiationNeeded { peer_id } => write!(f, "NegotiationNeeded({peer_id:?})"),
            Self::LocalCandidate { peer_id, .. } => write!(f, "LocalCandidate({peer_id:?})"),
            Self::ConnectionState { peer_id, state } => {
                write!(f, "ConnectionState({peer_id:?}, {state:?})")
            }
            Self::DataChannel { peer_id, channel } => {
                write!(f, "DataChannel({peer_id:?}, {})", channel.label())
            }
            Self::ChannelOpen { peer_id, label } => write!(f, "ChannelOpen({peer_id:?}, {label})"),
            Self::ChannelClosed { peer_id, label } => {
                write!(f, "ChannelClosed({peer_id:?}, {label})")
            }
            Self::ChannelMessage { peer_id, label, data } => {
                write!(f, "ChannelMessage({peer_id:?}, {label}, {} bytes)", data.len())
            }
        }
    }
}

/// Sending half of a transport event stream
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Relay (signaling server) connection
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Send one serialized signaling message
    ///
    /// # Errors
    /// Returns `TransportError` if the relay connection is unavailable
    async fn send(&self, message: String) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wire_format() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());

        let minimal: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(minimal, IceCandidate::new("c"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransportConnectionState::Failed.is_terminal());
        assert!(TransportConnectionState::Closed.is_terminal());
        assert!(!TransportConnectionState::Disconnected.is_terminal());
    }
}
