//! # Parley Core
//!
//! Peer negotiation and secure channel engine.
//!
//! Peers find each other through a relay-only signaling server, prove their
//! identities with signed challenges, negotiate a direct connection with
//! perfect negotiation, and exchange messages over data channels encrypted
//! with a per-peer key.
//!
//! This crate provides:
//! - Challenge authentication and the trust gate
//! - The perfect-negotiation state machine and candidate buffering
//! - The signaling wire protocol
//! - Chunked, authenticated message encryption
//! - Room and peer bookkeeping with exhaustive teardown
//! - The [`Engine`] that orchestrates all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine                                  │
//! │   (signaling input, transport callbacks, application calls)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Trust gate        │         Registry                │
//! │   (challenges, verified keys)  │   (rooms, peers, sessions)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Peer session                               │
//! │   (negotiator, candidate buffer, channels, codec, channel key)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Transport / signaling traits                     │
//! │   (native peer connection and relay, supplied by the host)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The native connection stack and the relay connection are external; the
//! host implements [`ConnectionFactory`] and [`SignalingSink`] and feeds
//! callbacks back through [`Engine::handle_transport_event`] and
//! [`Engine::handle_signaling`]. The `mock` feature ships in-memory versions
//! of both.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod candidate;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transport;

pub use auth::TrustGate;
pub use candidate::{Candidate, CandidateAction, CandidateBuffer};
pub use channel::{Channel, ChannelState, Message};
pub use codec::{Envelope, Reassembler, SecureCodec};
pub use config::{ChannelConfig, EngineConfig, NegotiationConfig, RtcConfig};
pub use engine::Engine;
pub use error::{PeerError, Result};
pub use events::EngineEvent;
pub use identity::IdentityManager;
pub use negotiation::{Negotiator, Phase, Role, SignalingState};
pub use registry::{Peer, Room};
pub use signaling::SignalingMessage;
pub use store::{MemoryStore, MessageStore, NullStore, StoreSnapshot};
pub use transport::{
    ConnectionFactory, DataChannel, IceCandidate, RtcConnection, SessionDescription,
    SignalingSink, TransportConnectionState, TransportError, TransportEvent,
};

/// Label of the default chat channel
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
