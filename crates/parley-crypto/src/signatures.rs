//! Ed25519 signatures for challenge-response authentication.
//!
//! A peer proves possession of its identity by signing a challenge string
//! issued by the signaling server or by another peer. Signatures travel over
//! the signaling wire as standard base64.
//!
//! ## Usage
//!
//! ```ignore
//! use parley_crypto::signatures::SigningKey;
//!
//! let signing_key = SigningKey::from_bytes(&seed);
//! let signature = signing_key.sign(b"abc123");
//! assert!(signing_key.verifying_key().verify(b"abc123", &signature).is_ok());
//! ```

use crate::CryptoError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signer, Verifier};
use zeroize::ZeroizeOnDrop;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Decode a base64 signature as carried by `challenge` messages
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] for bad encodings or lengths.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| CryptoError::InvalidSignature)?;
        Self::from_slice(&bytes)
    }

    /// Encode as standard base64
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Ed25519 signing key (private key)
///
/// Zeroized on drop to prevent key material from lingering in memory.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Create from raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Sign a message. Deterministic for a given key and message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Get the corresponding verifying key (public key)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }
}

/// Ed25519 verifying key (public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not
    /// represent a valid Ed25519 public key point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let signing_key = key(1);
        let signature = signing_key.sign(b"abc123");
        assert!(signing_key.verifying_key().verify(b"abc123", &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let signing_key = key(2);
        let signature = signing_key.sign(b"original challenge");
        assert!(
            signing_key
                .verifying_key()
                .verify(b"tampered challenge", &signature)
                .is_err()
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let signature = key(3).sign(b"abc123");
        assert!(key(4).verifying_key().verify(b"abc123", &signature).is_err());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let signing_key = key(5);
        let signature = signing_key.sign(b"abc123");

        let mut tampered = *signature.as_bytes();
        tampered[10] ^= 0x01;

        assert!(
            signing_key
                .verifying_key()
                .verify(b"abc123", &Signature::from_bytes(tampered))
                .is_err()
        );
    }

    #[test]
    fn test_signature_base64_roundtrip() {
        let signature = key(6).sign(b"challenge");
        let decoded = Signature::from_base64(&signature.to_base64()).unwrap();
        assert_eq!(signature, decoded);
    }

    #[test]
    fn test_signature_from_base64_rejects_garbage() {
        assert!(Signature::from_base64("not base64!").is_err());
        assert!(Signature::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_signature_deterministic() {
        let signing_key = key(7);
        assert_eq!(signing_key.sign(b"x"), signing_key.sign(b"x"));
    }
}
