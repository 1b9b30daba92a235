//! Constant-time comparisons.
//!
//! Used wherever a claimed identity is checked against a value derived from
//! key material.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Constant-time check that every byte is zero.
#[must_use]
pub fn ct_is_zero(bytes: &[u8]) -> bool {
    let zero = vec![0u8; bytes.len()];
    ct_eq(bytes, &zero)
}
