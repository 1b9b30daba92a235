//! Fuzz target for data-channel frame reassembly
//!
//! Feeds arbitrary frame sequences to one reassembler. It must never panic,
//! never hold more partial messages than its limit, and never complete a
//! message from garbage that then decrypts.

#![no_main]

use arbitrary::Arbitrary;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use libfuzzer_sys::fuzz_target;
use parley_core::codec::ReassemblyLimits;
use parley_core::{ChannelConfig, Envelope, Reassembler, SecureCodec};
use parley_crypto::{AeadKey, NativeProvider, PeerId, PublicKey};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Arbitrary)]
struct Frame {
    label: bool,
    id: u8,
    ciphertext: Vec<u8>,
    nonce: String,
    chunk_index: Option<u16>,
    chunk_count: Option<u16>,
    delay_ms: u16,
}

fuzz_target!(|frames: Vec<Frame>| {
    let config = ChannelConfig {
        max_chunk_count: 64,
        max_pending_messages: 4,
        max_message_bytes: 4096,
        ..ChannelConfig::default()
    };
    let mut reassembler = Reassembler::new(ReassemblyLimits::from(&config));
    let codec = SecureCodec::new(Arc::new(NativeProvider), &config);
    let key = AeadKey::new([1u8; 32]);
    let peer = PeerId::from_public_key(&PublicKey::from_bytes([2u8; 64]));

    let mut now = Instant::now();
    for frame in frames {
        now += Duration::from_millis(u64::from(frame.delay_ms));
        reassembler.prune(now);

        let envelope = Envelope {
            id: format!("{:032x}", frame.id),
            ciphertext: STANDARD.encode(&frame.ciphertext),
            nonce: frame.nonce,
            chunk_index: frame.chunk_index.map(u32::from),
            chunk_count: frame.chunk_count.map(u32::from),
        };
        let label = if frame.label { "chat" } else { "files" };

        if let Ok(Some(sealed)) = reassembler.accept(label, envelope, now) {
            assert!(codec.open(&key, &sealed, &peer, &peer).is_err());
        }
        assert!(reassembler.pending() <= config.max_pending_messages);
    }
});
