//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! Every outgoing channel message is sealed under the per-peer channel key
//! with a freshly drawn 192-bit nonce. The extended nonce makes random
//! generation safe: collisions are negligible long before any realistic
//! session length, and no counter has to be tracked or can wrap.
//!
//! ## Usage
//!
//! ```ignore
//! use parley_crypto::aead::{AeadKey, Nonce};
//!
//! let nonce = Nonce::random()?;
//! let ciphertext = key.encrypt(&nonce, b"secret", b"aad")?;
//! let plaintext = key.decrypt(&nonce, &ciphertext, b"aad")?;
//! ```

use crate::CryptoError;
use crate::random::fill_random;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] unless the slice is 24 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidNonceLength)?;
        Ok(Self(bytes))
    }

    /// Draw a fresh nonce from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG is unavailable.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; NONCE_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Decode a base64 nonce from a channel envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] for bad encodings or lengths.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| CryptoError::InvalidNonceLength)?;
        Self::from_slice(&bytes)
    }

    /// Encode as standard base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}
