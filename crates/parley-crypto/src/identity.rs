//! Peer identities.
//!
//! A peer's public key is the concatenation of its Ed25519 verifying key and
//! its X25519 agreement key. The peer identifier is derived from those 64
//! bytes alone, so anyone holding a public key can recompute the id without a
//! trusted directory.

use crate::constant_time::ct_eq;
use crate::hash::Kdf;
use crate::signatures::{SigningKey, VerifyingKey};
use crate::x25519::{AgreementKey, AgreementSecret};
use crate::{CryptoError, PEER_ID_BYTES, PEER_ID_CONTEXT, PUBLIC_KEY_SIZE};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Stable peer identifier: 32 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Derive the identifier for a public key.
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(Kdf::new(PEER_ID_CONTEXT).derive_hex(&public_key.to_bytes(), PEER_ID_BYTES))
    }

    /// Parse and validate an identifier received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPeerId`] unless the input is exactly
    /// 32 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self, CryptoError> {
        let well_formed = value.len() == PEER_ID_BYTES * 2
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(CryptoError::InvalidPeerId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// Whether this id was derived from `public_key` (constant time).
    #[must_use]
    pub fn matches(&self, public_key: &PublicKey) -> bool {
        ct_eq(
            self.0.as_bytes(),
            PeerId::from_public_key(public_key).0.as_bytes(),
        )
    }

    /// Full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl TryFrom<String> for PeerId {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Public half of a peer identity (Ed25519 || X25519, 64 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Assemble from the two component keys.
    #[must_use]
    pub fn from_parts(signing: &VerifyingKey, agreement: &AgreementKey) -> Self {
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        bytes[..32].copy_from_slice(&signing.to_bytes());
        bytes[32..].copy_from_slice(&agreement.to_bytes());
        Self(bytes)
    }

    /// Create from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the slice is not 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Decode from standard base64.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for bad encodings or lengths.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    /// Encode as standard base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    /// Raw bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// The Ed25519 half.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the half is not a valid point.
    pub fn signing_key(&self) -> Result<VerifyingKey, CryptoError> {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0[..32]);
        VerifyingKey::from_bytes(&bytes)
    }

    /// The X25519 half.
    #[must_use]
    pub fn agreement_key(&self) -> AgreementKey {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0[32..]);
        AgreementKey::from_bytes(bytes)
    }

    /// Identifier derived from this key.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.peer_id().short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Secret half of a peer identity. Zeroized on drop, never serialized.
pub struct SecretKey {
    signing: SigningKey,
    agreement: AgreementSecret,
}

impl SecretKey {
    /// Build from two independent 32-byte seeds.
    #[must_use]
    pub fn from_seeds(signing_seed: &[u8; 32], agreement_seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing_seed),
            agreement: AgreementSecret::from_bytes(agreement_seed),
        }
    }

    /// Ed25519 signing half.
    #[must_use]
    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    /// X25519 agreement half.
    #[must_use]
    pub fn agreement(&self) -> &AgreementSecret {
        &self.agreement
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::from_parts(&self.signing.verifying_key(), &self.agreement.public_key())
    }
}

/// A complete local identity.
pub struct KeyPair {
    peer_id: PeerId,
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl KeyPair {
    /// Wrap a secret key, deriving the public key and peer id.
    #[must_use]
    pub fn from_secret(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        Self {
            peer_id: public_key.peer_id(),
            public_key,
            secret_key,
        }
    }

    /// Local peer identifier.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Local public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Local secret key.
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
