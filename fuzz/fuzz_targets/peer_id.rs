//! Fuzz test for peer ID and public key parsing
//!
//! Tests that arbitrary input doesn't cause panics when parsed as peer IDs
//! or public keys, and that accepted keys always hash to a valid peer ID.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_crypto::{PeerId, PublicKey};

fuzz_target!(|data: &[u8]| {
    // Test 1: textual peer IDs (32 lowercase hex chars)
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(peer_id) = PeerId::parse(s) {
            assert_eq!(peer_id.as_str(), s);
            assert_eq!(PeerId::parse(peer_id.as_str()).ok(), Some(peer_id));
        }

        // Base64 public keys as carried in challenge responses
        if let Ok(key) = PublicKey::from_base64(s) {
            let derived = key.peer_id();
            assert!(derived.matches(&key));
            assert!(PeerId::parse(derived.as_str()).is_ok());
        }
    }

    // Test 2: raw public keys (must be exactly 64 bytes)
    match PublicKey::from_slice(data) {
        Ok(key) => {
            assert_eq!(data.len(), 64);
            assert_eq!(&key.to_bytes()[..], data);
            assert_eq!(PublicKey::from_base64(&key.to_base64()).ok(), Some(key));
        }
        Err(_) => assert_ne!(data.len(), 64),
    }
});
