//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG. Failures are
//! reported instead of panicking so callers can surface `CryptoUnavailable`.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate `len` random bytes encoded as lowercase hex.
///
/// Used for challenge strings and message identifiers.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_hex(len: usize) -> Result<String, CryptoError> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(hex::encode(buf))
}
