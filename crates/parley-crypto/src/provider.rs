//! Injectable cryptographic capability.
//!
//! The engine never calls a primitive directly; it goes through a
//! [`CryptoProvider`] so that alternate backends (a hardware token, a
//! compiled module in a sandboxed host) can replace [`NativeProvider`]
//! without touching negotiation or channel logic.

use crate::aead::{AeadKey, Nonce};
use crate::hash::hkdf;
use crate::identity::{KeyPair, PublicKey, SecretKey};
use crate::random::fill_random;
use crate::signatures::Signature;
use crate::{CHANNEL_KEY_INFO, CryptoError};
use zeroize::Zeroize;

/// Cryptographic primitives consumed by the engine.
pub trait CryptoProvider: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Fill `buf` with secure random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] when no secure source exists.
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError>;

    /// Generate a fresh identity.
    ///
    /// # Errors
    ///
    /// Fails when randomness or asymmetric primitives are unavailable.
    fn generate_keypair(&self) -> Result<KeyPair, CryptoError>;

    /// Sign `message` with the local identity.
    fn sign(&self, keypair: &KeyPair, message: &[u8]) -> Signature;

    /// Verify a signature. Malformed keys verify as `false`.
    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool;

    /// Derive the symmetric channel key shared with `remote`.
    ///
    /// Both sides derive the same key: the salt is the two peer ids in sorted
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for low-order remote keys.
    fn agree(&self, keypair: &KeyPair, remote: &PublicKey) -> Result<AeadKey, CryptoError>;

    /// Encrypt under a freshly drawn nonce.
    ///
    /// # Errors
    ///
    /// Fails if randomness is unavailable or encryption fails.
    fn seal(
        &self,
        key: &AeadKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Nonce, Vec<u8>), CryptoError>;

    /// Decrypt and authenticate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on any authentication failure.
    fn open(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Default backend: ed25519-dalek, x25519-dalek, chacha20poly1305, blake3.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProvider;

impl CryptoProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        fill_random(buf)
    }

    fn generate_keypair(&self) -> Result<KeyPair, CryptoError> {
        let mut signing_seed = [0u8; 32];
        let mut agreement_seed = [0u8; 32];
        self.fill_random(&mut signing_seed)?;
        self.fill_random(&mut agreement_seed)?;

        let secret = SecretKey::from_seeds(&signing_seed, agreement_seed);
        signing_seed.zeroize();
        agreement_seed.zeroize();

        Ok(KeyPair::from_secret(secret))
    }

    fn sign(&self, keypair: &KeyPair, message: &[u8]) -> Signature {
        keypair.secret_key().signing().sign(message)
    }

    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        match public_key.signing_key() {
            Ok(key) => key.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }

    fn agree(&self, keypair: &KeyPair, remote: &PublicKey) -> Result<AeadKey, CryptoError> {
        let shared = keypair
            .secret_key()
            .agreement()
            .exchange(&remote.agreement_key())
            .ok_or(CryptoError::InvalidPublicKey)?;

        let local_id = keypair.peer_id();
        let remote_id = remote.peer_id();
        let (first, second) = if local_id <= &remote_id {
            (local_id, &remote_id)
        } else {
            (&remote_id, local_id)
        };
        let salt = [first.as_str().as_bytes(), second.as_str().as_bytes()].concat();

        let mut key = [0u8; 32];
        hkdf(&salt, shared.as_bytes(), CHANNEL_KEY_INFO, &mut key);
        let aead_key = AeadKey::new(key);
        key.zeroize();
        Ok(aead_key)
    }

    fn seal(
        &self,
        key: &AeadKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Nonce, Vec<u8>), CryptoError> {
        let nonce = Nonce::random()?;
        let ciphertext = key.encrypt(&nonce, plaintext, aad)?;
        Ok((nonce, ciphertext))
    }

    fn open(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        key.decrypt(nonce, ciphertext, aad)
    }
}
