//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure, wrong key, tampered data)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Malformed peer identifier
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Base64 or hex payload could not be decoded
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// The provider lacks a primitive required for the operation
    #[error("crypto primitive unavailable: {0}")]
    Unavailable(&'static str),
}
