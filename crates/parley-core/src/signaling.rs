//! Signaling wire protocol.
//!
//! Messages are JSON objects discriminated by a `type` field. The relay is a
//! dumb forwarder: every negotiation message names its sender, recipient and
//! room so it can be routed without inspection.
//!
//! ```text
//! {"type":"peerId","challenge":"9f..","message":"hello","fromPeerId":"..","roomId":".."}
//! {"type":"challenge","challenge":"9f..","signature":"..","fromPeerId":"..","publicKey":"..","toPeerId":".."}
//! {"type":"description","description":{"type":"offer","sdp":".."},"fromPeerId":"..","toPeerId":"..","roomId":".."}
//! {"type":"candidate","candidate":{"candidate":"..","sdpMid":"0"},"fromPeerId":"..","toPeerId":"..","roomId":".."}
//! ```

use crate::error::{PeerError, Result};
use crate::transport::{IceCandidate, SessionDescription, SignalingSink};
use parley_crypto::{PeerId, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Server-issued identity challenge
    ClientId {
        /// Challenge to sign
        challenge: String,
        /// Human-readable greeting
        message: String,
    },

    /// Peer-issued identity challenge
    PeerId {
        /// Challenge to sign
        challenge: String,
        /// Human-readable greeting
        message: String,
        /// Issuer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        /// Addressee; absent for a room-wide announcement
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        /// Room the issuer announces itself in
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Signed response to a `clientId` or `peerId` challenge
    Challenge {
        /// The challenge being answered
        challenge: String,
        /// Base64 Ed25519 signature over the challenge
        signature: String,
        /// Responder
        from_peer_id: PeerId,
        /// Responder's public key; must hash to `from_peer_id`
        public_key: PublicKey,
        /// Issuer of the challenge; absent when answering the server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<PeerId>,
        /// Room context of the challenge
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Offer or answer
    Description {
        /// Session description
        description: SessionDescription,
        /// Sender
        from_peer_id: PeerId,
        /// Recipient
        to_peer_id: PeerId,
        /// Room
        room_id: String,
    },

    /// Connectivity candidate
    Candidate {
        /// ICE candidate
        candidate: IceCandidate,
        /// Sender
        from_peer_id: PeerId,
        /// Recipient
        to_peer_id: PeerId,
        /// Room
        room_id: String,
    },
}

impl SignalingMessage {
    /// Parse a raw relay message.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Signaling`] for malformed JSON, unknown types,
    /// malformed peer ids or public keys.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize for the relay.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Signaling`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientId { .. } => "clientId",
            Self::PeerId { .. } => "peerId",
            Self::Challenge { .. } => "challenge",
            Self::Description { .. } => "description",
            Self::Candidate { .. } => "candidate",
        }
    }

    /// Claimed sender, when the message carries one
    #[must_use]
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            Self::ClientId { .. } => None,
            Self::PeerId { from_peer_id, .. } => from_peer_id.as_ref(),
            Self::Challenge { from_peer_id, .. }
            | Self::Description { from_peer_id, .. }
            | Self::Candidate { from_peer_id, .. } => Some(from_peer_id),
        }
    }
}

/// Outbound half of the signaling handler: stamps the local id on every
/// message and hands it to the relay.
#[derive(Clone)]
pub struct Signaler {
    local: PeerId,
    sink: Arc<dyn SignalingSink>,
}

impl Signaler {
    /// Create a signaler for the local peer
    #[must_use]
    pub fn new(local: PeerId, sink: Arc<dyn SignalingSink>) -> Self {
        Self { local, sink }
    }

    /// Local peer id
    #[must_use]
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    /// Send a pre-built message
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Transport`] if the relay is unavailable.
    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        let encoded = message.encode()?;
        tracing::trace!("Signaling out: {}", message.kind());
        self.sink.send(encoded).await.map_err(PeerError::from)
    }

    /// Send an offer or answer to `to`
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Transport`] if the relay is unavailable.
    pub async fn send_description(
        &self,
        to: &PeerId,
        room_id: &str,
        description: SessionDescription,
    ) -> Result<()> {
        self.send(&SignalingMessage::Description {
            description,
            from_peer_id: self.local.clone(),
            to_peer_id: to.clone(),
            room_id: room_id.to_string(),
        })
        .await
    }

    /// Send a local candidate to `to`
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Transport`] if the relay is unavailable.
    pub async fn send_candidate(
        &self,
        to: &PeerId,
        room_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.send(&SignalingMessage::Candidate {
            candidate,
            from_peer_id: self.local.clone(),
            to_peer_id: to.clone(),
            room_id: room_id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::{CryptoProvider, NativeProvider};

    const A: &str = "0123456789abcdef0123456789abcdef";
    const B: &str = "fedcba9876543210fedcba9876543210";

    #[test]
    fn test_decode_client_id() {
        let msg =
            SignalingMessage::decode(r#"{"type":"clientId","challenge":"abc123","message":"hi"}"#)
                .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::ClientId {
                challenge: "abc123".into(),
                message: "hi".into()
            }
        );
        assert_eq!(msg.sender(), None);
    }

    #[test]
    fn test_description_wire_shape() {
        let msg = SignalingMessage::Description {
            description: SessionDescription::offer("v=0"),
            from_peer_id: PeerId::parse(A).unwrap(),
            to_peer_id: PeerId::parse(B).unwrap(),
            room_id: "room".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "description");
        assert_eq!(value["description"]["type"], "offer");
        assert_eq!(value["fromPeerId"], A);
        assert_eq!(value["toPeerId"], B);
        assert_eq!(value["roomId"], "room");
    }

    #[test]
    fn test_challenge_roundtrip_carries_public_key() {
        let keypair = NativeProvider.generate_keypair().unwrap();
        let msg = SignalingMessage::Challenge {
            challenge: "abc123".into(),
            signature: NativeProvider.sign(&keypair, b"abc123").to_base64(),
            from_peer_id: keypair.peer_id().clone(),
            public_key: *keypair.public_key(),
            to_peer_id: None,
            room_id: None,
        };
        let encoded = msg.encode().unwrap();
        assert!(!encoded.contains("toPeerId"));
        assert_eq!(SignalingMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_peer_id_optional_fields() {
        let msg = SignalingMessage::decode(&format!(
            r#"{{"type":"peerId","challenge":"c","message":"m","fromPeerId":"{A}"}}"#
        ))
        .unwrap();
        assert_eq!(msg.sender().map(PeerId::as_str), Some(A));
    }

    #[test]
    fn test_malformed_messages_rejected() {
        for raw in [
            "not json",
            r#"{"type":"bogus"}"#,
            r#"{"type":"candidate","candidate":{"candidate":"c"}}"#,
            r#"{"type":"peerId","challenge":"c","message":"m","fromPeerId":"XYZ"}"#,
        ] {
            assert!(
                matches!(SignalingMessage::decode(raw), Err(PeerError::Signaling(_))),
                "accepted {raw}"
            );
        }
    }
}
