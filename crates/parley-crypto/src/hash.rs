//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - Fast cryptographic hashing
//! - Context-specific KDF (peer and room identifiers)
//! - HKDF-like extract/expand for channel keys

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let kdf = Kdf::new("parley:room:v1");
    /// let id = kdf.derive_key(url.as_bytes());
    /// ```
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);

        let mut reader = hasher.finalize_xof();
        reader.fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }

    /// Derive `bytes` bytes and return them as lowercase hex.
    #[must_use]
    pub fn derive_hex(&self, ikm: &[u8], bytes: usize) -> String {
        let mut output = vec![0u8; bytes];
        self.derive(ikm, &mut output);
        hex::encode(output)
    }
}

/// HKDF-Extract: Extract a pseudorandom key from input key material.
///
/// Corresponds to HKDF-Extract from RFC 5869, but using BLAKE3.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: Expand a pseudorandom key into arbitrary-length output.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);

    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}

/// HKDF: Combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let kdf = Kdf::new("test-context");
        assert_eq!(kdf.derive_key(b"ikm"), kdf.derive_key(b"ikm"));
    }

    #[test]
    fn test_kdf_different_contexts() {
        let a = Kdf::new("context-1").derive_key(b"same input");
        let b = Kdf::new("context-2").derive_key(b"same input");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_hex_length() {
        let hex = Kdf::new("ctx").derive_hex(b"wss://relay.example/room", 16);
        assert_eq!(hex.len(), 32);
    }

    #[test]
    fn test_hkdf_salt_changes_output() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf(b"salt-a", b"secret", b"info", &mut a);
        hkdf(b"salt-b", b"secret", b"info", &mut b);
        assert_ne!(a, b);
    }
}
