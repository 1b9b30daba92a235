//! Property-based tests for Parley
//!
//! Uses proptest to verify invariants across large input spaces.

use parley_core::codec::ReassemblyLimits;
use parley_core::{ChannelConfig, Envelope, Reassembler, SecureCodec};
use parley_crypto::{AeadKey, CryptoProvider, NativeProvider, PeerId};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Instant;

fn peer() -> PeerId {
    NativeProvider.generate_keypair().unwrap().peer_id().clone()
}

// ============================================================================
// Candidate Buffer Properties
// ============================================================================

mod candidate_properties {
    use super::*;
    use parley_core::{Candidate, CandidateAction, CandidateBuffer, IceCandidate};

    fn candidate(from: &PeerId, sdp: &str) -> Candidate {
        Candidate {
            ice_candidate: IceCandidate::new(sdp),
            with_peer_id: from.clone(),
        }
    }

    proptest! {
        /// Buffered candidates flush in arrival order, each exactly once
        #[test]
        fn flush_preserves_arrival_order(
            sdps in prop::collection::vec("candidate:[a-e]{1,2}", 0..32),
        ) {
            let from = peer();
            let mut buffer = CandidateBuffer::new();
            for sdp in &sdps {
                let action = buffer.add(candidate(&from, sdp), false, false);
                prop_assert!(matches!(action, CandidateAction::Buffered | CandidateAction::Dropped));
            }

            let mut expected: Vec<&str> = Vec::new();
            for sdp in &sdps {
                if !expected.contains(&sdp.as_str()) {
                    expected.push(sdp);
                }
            }

            let flushed: Vec<String> = buffer.flush().into_iter().map(|c| c.candidate).collect();
            prop_assert_eq!(flushed, expected.iter().map(|s| s.to_string()).collect::<Vec<_>>());
            prop_assert!(buffer.is_empty());

            // Nothing released is ever applied again.
            for sdp in &sdps {
                prop_assert_eq!(buffer.add(candidate(&from, sdp), true, false), CandidateAction::Dropped);
            }
            prop_assert!(buffer.flush().is_empty());
        }

        /// While an offer is ignored, every candidate is dropped
        #[test]
        fn ignored_offer_drops_everything(
            sdps in prop::collection::vec("candidate:[a-z]{1,8}", 1..16),
            ready in any::<bool>(),
        ) {
            let from = peer();
            let mut buffer = CandidateBuffer::new();
            for sdp in &sdps {
                prop_assert_eq!(buffer.add(candidate(&from, sdp), ready, true), CandidateAction::Dropped);
            }
            prop_assert!(buffer.is_empty());
            prop_assert!(buffer.flush().is_empty());
        }
    }
}

// ============================================================================
// Secure Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use parley_core::PeerError;

    fn codec(max_chunk_bytes: usize) -> SecureCodec {
        let config = ChannelConfig {
            max_chunk_bytes,
            ..ChannelConfig::default()
        };
        SecureCodec::new(Arc::new(NativeProvider), &config)
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(ReassemblyLimits::from(&ChannelConfig::default()))
    }

    /// Reorder `frames` by the sort keys in `order`
    fn permute(frames: Vec<Envelope>, order: &[u64]) -> Vec<Envelope> {
        let mut keyed: Vec<(u64, Envelope)> = frames
            .into_iter()
            .enumerate()
            .map(|(i, f)| (order[i % order.len()], f))
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, f)| f).collect()
    }

    proptest! {
        /// Any arrival order of the chunks reproduces the message
        #[test]
        fn reassembly_is_order_independent(
            body in "\\PC{0,600}",
            chunk in 16usize..128,
            order in prop::collection::vec(any::<u64>(), 1..64),
        ) {
            let (from, to) = (peer(), peer());
            let key = AeadKey::new([3u8; 32]);
            let codec = codec(chunk);
            let id = codec.message_id().unwrap();

            let frames = codec.seal(&key, &id, &from, &to, 42, &body).unwrap();
            let count = frames.len();
            let mut reassembler = reassembler();
            let now = Instant::now();

            let mut completed = None;
            for (i, frame) in permute(frames, &order).into_iter().enumerate() {
                let result = reassembler.accept("chat", frame, now).unwrap();
                if i + 1 < count {
                    prop_assert!(result.is_none());
                } else {
                    completed = result;
                }
            }

            let sealed = completed.expect("complete after the last chunk");
            prop_assert_eq!(reassembler.pending(), 0);
            let opened = codec.open(&key, &sealed, &from, &to).unwrap();
            prop_assert_eq!(opened.body, body);
            prop_assert_eq!(opened.timestamp, 42);
        }

        /// Flipping any ciphertext bit is detected after reassembly
        #[test]
        fn tampering_fails_closed(
            body in "[a-z ]{1,300}",
            frame_pick in any::<usize>(),
            byte_pick in any::<usize>(),
            bit in 0u8..8,
        ) {
            let (from, to) = (peer(), peer());
            let key = AeadKey::new([9u8; 32]);
            let codec = codec(32);
            let id = codec.message_id().unwrap();

            let mut frames = codec.seal(&key, &id, &from, &to, 1, &body).unwrap();
            let target = frame_pick % frames.len();
            let mut raw = STANDARD.decode(&frames[target].ciphertext).unwrap();
            let position = byte_pick % raw.len();
            raw[position] ^= 1 << bit;
            frames[target].ciphertext = STANDARD.encode(&raw);

            let mut reassembler = reassembler();
            let now = Instant::now();
            let mut sealed = None;
            for frame in frames {
                if let Some(done) = reassembler.accept("chat", frame, now).unwrap() {
                    sealed = Some(done);
                }
            }

            let sealed = sealed.expect("all chunks delivered");
            prop_assert_eq!(
                codec.open(&key, &sealed, &from, &to),
                Err(PeerError::DecryptionFailed)
            );
        }

        /// Arbitrary frames never panic the reassembler
        #[test]
        fn arbitrary_frames_never_panic(
            raw in "\\PC{0,200}",
            index in prop::option::of(0u32..2048),
            count in prop::option::of(0u32..2048),
        ) {
            let mut reassembler = reassembler();
            let envelope = Envelope {
                id: "ab".repeat(16),
                ciphertext: raw.clone(),
                nonce: raw,
                chunk_index: index,
                chunk_count: count,
            };
            let _ = reassembler.accept("chat", envelope, Instant::now());
            prop_assert!(reassembler.pending() <= 1);
        }
    }
}

// ============================================================================
// Wire Format Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use parley_core::SignalingMessage;

    proptest! {
        /// Decoding arbitrary relay input fails cleanly, never panics
        #[test]
        fn signaling_decode_total(raw in "\\PC{0,256}") {
            let _ = SignalingMessage::decode(&raw);
            let _ = Envelope::decode(&raw);
        }

        /// Any message with a `type` tag we do not know is rejected
        #[test]
        fn unknown_type_rejected(kind in "[a-z]{1,12}") {
            prop_assume!(!["clientId", "peerId", "challenge", "description", "candidate"]
                .contains(&kind.as_str()));
            let raw = format!(r#"{{"type":"{kind}","challenge":"x","message":"y"}}"#);
            prop_assert!(SignalingMessage::decode(&raw).is_err());
        }
    }
}

// ============================================================================
// Channel History Properties
// ============================================================================

mod channel_properties {
    use super::*;
    use parley_core::{Channel, Message};

    proptest! {
        /// History stays sorted by (timestamp, id) and free of duplicates
        #[test]
        fn history_sorted_and_unique(
            entries in prop::collection::vec((0u64..1000, 0u8..16), 0..64),
        ) {
            let (from, to) = (peer(), peer());
            let mut channel = Channel::new(None, "chat", to.clone());
            let mut ids = std::collections::HashSet::new();

            for (timestamp, id) in &entries {
                let id = format!("{id:032x}");
                let fresh = ids.insert(id.clone());
                let inserted = channel.insert(Message {
                    id,
                    message: String::new(),
                    from_peer_id: from.clone(),
                    to_peer_id: to.clone(),
                    timestamp: *timestamp,
                });
                prop_assert_eq!(inserted, fresh);
            }

            let messages = channel.messages();
            prop_assert_eq!(messages.len(), ids.len());
            for pair in messages.windows(2) {
                prop_assert!(
                    (pair[0].timestamp, &pair[0].id) < (pair[1].timestamp, &pair[1].id)
                );
            }
        }
    }
}
