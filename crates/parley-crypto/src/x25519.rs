//! X25519 Diffie-Hellman key agreement (RFC 7748).
//!
//! Each peer holds a static agreement secret for the lifetime of its
//! identity. Combining the local secret with a remote agreement key yields the
//! shared secret that seeds the per-peer channel key.

use crate::constant_time::ct_is_zero;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 static secret (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct AgreementSecret(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgreementKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl AgreementSecret {
    /// Build a secret from 32 random bytes (clamped per RFC 7748).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the public agreement key.
    #[must_use]
    pub fn public_key(&self) -> AgreementKey {
        AgreementKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key agreement.
    ///
    /// Returns `None` if the peer's key is a low-order point.
    #[must_use]
    pub fn exchange(&self, peer_public: &AgreementKey) -> Option<SharedSecret> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if ct_is_zero(shared.as_bytes()) {
            return None;
        }

        Some(SharedSecret(shared))
    }
}

impl AgreementKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }
}

impl SharedSecret {
    /// Raw shared secret. Feed through a KDF before use as a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}
