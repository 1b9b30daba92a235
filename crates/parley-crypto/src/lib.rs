//! # Parley Crypto
//!
//! Cryptographic primitives for the Parley peer engine.
//!
//! This crate provides:
//! - Peer identities (`KeyPair`, `PublicKey`, `PeerId`)
//! - Ed25519 challenge signatures
//! - X25519 key agreement for per-peer channel keys
//! - `XChaCha20-Poly1305` AEAD with random per-message nonces
//! - BLAKE3 hashing and key derivation
//! - The injectable [`CryptoProvider`] capability
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Signatures | Ed25519 | 128-bit |
//! | Key Agreement | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit collision |
//! | Peer ID | BLAKE3 (truncated to 128 bits) | 64-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod identity;
pub mod provider;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use aead::{AeadKey, Nonce};
pub use error::CryptoError;
pub use identity::{KeyPair, PeerId, PublicKey};
pub use provider::{CryptoProvider, NativeProvider};
pub use signatures::Signature;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Combined peer public key size (Ed25519 || X25519)
pub const PUBLIC_KEY_SIZE: usize = ED25519_PUBLIC_KEY_SIZE + X25519_PUBLIC_KEY_SIZE;

/// Raw bytes of a peer identifier before hex encoding
pub const PEER_ID_BYTES: usize = 16;

/// KDF context for peer identifiers
pub const PEER_ID_CONTEXT: &str = "parley:peer-id:v1";

/// HKDF info for per-peer channel keys
pub const CHANNEL_KEY_INFO: &[u8] = b"parley:channel-key:v1";
