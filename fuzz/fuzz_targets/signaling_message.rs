//! Fuzz target for relay message decoding
//!
//! Arbitrary relay input must decode to a message or fail cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_core::SignalingMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(message) = SignalingMessage::decode(raw) {
        // Anything we accept must re-encode and decode to the same message.
        let encoded = message.encode().expect("decoded messages re-encode");
        let again = SignalingMessage::decode(&encoded).expect("re-encoded message decodes");
        assert_eq!(message, again);
        let _ = message.sender();
    }
});
