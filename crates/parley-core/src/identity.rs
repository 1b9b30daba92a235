//! Local identity management.

use crate::error::{PeerError, Result};
use parley_crypto::{AeadKey, CryptoProvider, KeyPair, PeerId, PublicKey, Signature};
use std::sync::Arc;

/// Owns the local keypair and the crypto provider behind it.
///
/// The secret key never leaves this type: callers get signatures and derived
/// channel keys, never key material.
pub struct IdentityManager {
    provider: Arc<dyn CryptoProvider>,
    keypair: KeyPair,
}

impl IdentityManager {
    /// Generate a fresh identity with `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::CryptoUnavailable`] if the provider has no secure
    /// randomness or asymmetric primitives.
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        let keypair = Self::generate_keypair(provider.as_ref())?;
        tracing::info!(
            "Generated identity {} with {} crypto provider",
            keypair.peer_id().short(),
            provider.name()
        );
        Ok(Self { provider, keypair })
    }

    /// Wrap an existing keypair (e.g. loaded from disk).
    #[must_use]
    pub fn from_keypair(provider: Arc<dyn CryptoProvider>, keypair: KeyPair) -> Self {
        Self { provider, keypair }
    }

    /// Generate a keypair without installing it.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::CryptoUnavailable`] on provider failure.
    pub fn generate_keypair(provider: &dyn CryptoProvider) -> Result<KeyPair> {
        provider
            .generate_keypair()
            .map_err(|e| PeerError::CryptoUnavailable(e.to_string()))
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.keypair.peer_id()
    }

    /// Local public key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// The injected provider
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    /// Sign `message` with the local identity
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.provider.sign(&self.keypair, message)
    }

    /// Verify a remote signature. Never fails; bad input verifies as `false`.
    #[must_use]
    pub fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        self.provider.verify(public_key, message, signature)
    }

    /// Derive the channel key shared with `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::AuthenticationFailed`] for a low-order remote key.
    pub fn derive_shared_key(&self, remote: &PublicKey) -> Result<AeadKey> {
        Ok(self.provider.agree(&self.keypair, remote)?)
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("peer_id", self.peer_id())
            .field("provider", &self.provider.name())
            .finish()
    }
}
