//! Error types for the peer engine
//!
//! Errors are split by how far they propagate:
//!
//! - **Contained**: dropped and logged where they occur. The message that
//!   caused them is discarded and the peer's state machine is untouched
//!   (authentication failures, decryption failures, malformed signaling).
//! - **Fatal**: the affected peer is torn down by the registry and the
//!   application is notified (negotiation and transport failures).
//!
//! Glare between simultaneous offers is resolved inside the negotiation state
//! machine and never appears here.
//!
//! # Example
//!
//! ```no_run
//! use parley_core::{PeerError, Result};
//!
//! fn report(err: PeerError) {
//!     if err.is_contained() {
//!         // message dropped, peer unaffected
//!     } else if err.is_fatal() {
//!         // peer resources already released
//!     }
//! }
//! ```

use parley_crypto::{CryptoError, PeerId};
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the peer engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    // ============ Authentication ============
    /// Challenge signature missing, invalid, or from an untrusted sender
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Cow<'static, str>),

    // ============ Negotiation ============
    /// Description could not be applied or exchanged
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(Cow<'static, str>),

    /// Connection did not reach the connected state in time
    #[error("Negotiation timed out for peer {}", .0.short())]
    NegotiationTimeout(PeerId),

    // ============ Channels ============
    /// Data channel could not be opened
    #[error("Channel open failed: {0}")]
    ChannelOpenFailed(Cow<'static, str>),

    /// Data channel did not open in time
    #[error("Channel '{0}' did not open in time")]
    ChannelOpenTimeout(String),

    /// No channel with this label for the peer
    #[error("Channel '{label}' not found for peer {}", .peer_id.short())]
    ChannelNotFound {
        /// Remote peer
        peer_id: PeerId,
        /// Channel label
        label: String,
    },

    // ============ Cryptography ============
    /// Inbound channel message failed authentication
    #[error("Decryption failed")]
    DecryptionFailed,

    /// No secure randomness or asymmetric primitives available
    #[error("Crypto unavailable: {0}")]
    CryptoUnavailable(String),

    // ============ Collaborators ============
    /// Underlying peer-connection transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed signaling or channel payload
    #[error("Signaling error: {0}")]
    Signaling(Cow<'static, str>),

    // ============ Registry ============
    /// Peer is not registered
    #[error("Peer not found: {}", .0.short())]
    PeerNotFound(PeerId),

    /// Room has not been joined
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    // ============ Configuration & State ============
    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Peer was removed while the operation was in flight
    #[error("Peer closed")]
    Closed,
}

impl PeerError {
    /// Returns true if the error is dropped where it occurs and never
    /// disturbs the peer's state machine.
    #[must_use]
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            PeerError::AuthenticationFailed(_)
                | PeerError::DecryptionFailed
                | PeerError::Signaling(_)
        )
    }

    /// Returns true if the error tears the affected peer down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PeerError::NegotiationFailed(_)
                | PeerError::NegotiationTimeout(_)
                | PeerError::Transport(_)
        )
    }

    /// Create an authentication error with static context (zero allocation)
    #[must_use]
    pub const fn authentication(context: &'static str) -> Self {
        PeerError::AuthenticationFailed(Cow::Borrowed(context))
    }

    /// Create a negotiation error with static context (zero allocation)
    #[must_use]
    pub const fn negotiation(context: &'static str) -> Self {
        PeerError::NegotiationFailed(Cow::Borrowed(context))
    }

    /// Create a signaling error with static context (zero allocation)
    #[must_use]
    pub const fn signaling(context: &'static str) -> Self {
        PeerError::Signaling(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        PeerError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        PeerError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for PeerError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => PeerError::DecryptionFailed,
            CryptoError::InvalidSignature | CryptoError::InvalidPublicKey => {
                PeerError::AuthenticationFailed(Cow::Owned(err.to_string()))
            }
            other => PeerError::CryptoUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Signaling(Cow::Owned(err.to_string()))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::parse("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_contained_errors() {
        assert!(PeerError::authentication("bad signature").is_contained());
        assert!(PeerError::DecryptionFailed.is_contained());
        assert!(PeerError::signaling("bad json").is_contained());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(PeerError::negotiation("malformed sdp").is_fatal());
        assert!(PeerError::NegotiationTimeout(peer()).is_fatal());
        assert!(PeerError::Transport("ice failed".into()).is_fatal());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let all = [
            PeerError::authentication("x"),
            PeerError::negotiation("x"),
            PeerError::NegotiationTimeout(peer()),
            PeerError::ChannelOpenFailed(Cow::Borrowed("x")),
            PeerError::ChannelOpenTimeout("chat".into()),
            PeerError::DecryptionFailed,
            PeerError::CryptoUnavailable("x".into()),
            PeerError::Transport("x".into()),
            PeerError::signaling("x"),
            PeerError::PeerNotFound(peer()),
            PeerError::RoomNotFound("r".into()),
            PeerError::invalid_config("x"),
            PeerError::invalid_state("x"),
            PeerError::Closed,
        ];
        for err in all {
            assert!(
                !(err.is_contained() && err.is_fatal()),
                "{err} is both contained and fatal"
            );
        }
    }

    #[test]
    fn test_error_display_uses_short_peer_id() {
        let err = PeerError::PeerNotFound(peer());
        assert_eq!(err.to_string(), "Peer not found: 01234567");
    }

    #[test]
    fn test_crypto_error_conversion() {
        assert_eq!(
            PeerError::from(CryptoError::DecryptionFailed),
            PeerError::DecryptionFailed
        );
        assert!(matches!(
            PeerError::from(CryptoError::RandomFailed),
            PeerError::CryptoUnavailable(_)
        ));
        assert!(PeerError::from(CryptoError::InvalidSignature).is_contained());
    }
}
