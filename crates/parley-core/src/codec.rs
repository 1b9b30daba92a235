//! Secure messaging codec.
//!
//! Each application message is encrypted once under the peer's channel key
//! with a fresh random nonce, then the ciphertext is cut into chunks small
//! enough for one data-channel frame. Every chunk repeats the nonce, so the
//! receiver can rebuild the exact ciphertext regardless of arrival order and
//! chunk boundaries never affect validity.
//!
//! ## Frame format
//!
//! ```text
//! {"id":"<32 hex>","ciphertext":"<base64>","nonce":"<base64>","chunkIndex":0,"chunkCount":3}
//! ```
//!
//! Single-frame messages omit `chunkIndex`/`chunkCount`. The associated data
//! binds the ciphertext to its id, sender and recipient:
//! `id ␟ fromPeerId ␟ toPeerId` (unit separator, U+001F).

use crate::config::ChannelConfig;
use crate::error::{PeerError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use parley_crypto::{AeadKey, CryptoProvider, Nonce, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Separator between associated-data fields
pub const AAD_SEPARATOR: u8 = 0x1f;

/// Random bytes in a message id (hex encoded)
pub const MESSAGE_ID_BYTES: usize = 16;

/// One data-channel frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message id
    pub id: String,
    /// Base64 ciphertext slice
    pub ciphertext: String,
    /// Base64 nonce, identical in every chunk of a message
    pub nonce: String,
    /// Zero-based chunk position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    /// Total chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
}

impl Envelope {
    /// Parse a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Signaling`] for malformed frames.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize to a frame.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Signaling`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encrypted plaintext layout
#[derive(Serialize, Deserialize)]
struct Plaintext {
    timestamp: u64,
    body: String,
}

/// A fully reassembled, still encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Message id
    pub id: String,
    /// Nonce
    pub nonce: Nonce,
    /// Complete ciphertext with tag
    pub ciphertext: Vec<u8>,
}

/// Decrypted message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    /// Sender timestamp (ms since Unix epoch)
    pub timestamp: u64,
    /// Application body
    pub body: String,
}

fn associated_data(id: &str, from: &PeerId, to: &PeerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(id.len() + 66);
    aad.extend_from_slice(id.as_bytes());
    aad.push(AAD_SEPARATOR);
    aad.extend_from_slice(from.as_str().as_bytes());
    aad.push(AAD_SEPARATOR);
    aad.extend_from_slice(to.as_str().as_bytes());
    aad
}

/// Encrypts and frames outgoing messages, authenticates incoming ones
#[derive(Clone)]
pub struct SecureCodec {
    provider: Arc<dyn CryptoProvider>,
    max_chunk_bytes: usize,
}

impl SecureCodec {
    /// Create a codec
    #[must_use]
    pub fn new(provider: Arc<dyn CryptoProvider>, config: &ChannelConfig) -> Self {
        Self {
            provider,
            max_chunk_bytes: config.max_chunk_bytes.max(1),
        }
    }

    /// Fresh message id: 32 lowercase hex characters
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::CryptoUnavailable`] without secure randomness.
    pub fn message_id(&self) -> Result<String> {
        let mut raw = [0u8; MESSAGE_ID_BYTES];
        self.provider.fill_random(&mut raw)?;
        Ok(hex::encode(raw))
    }

    /// Encrypt `body` and split it into frames.
    ///
    /// # Errors
    ///
    /// Fails if randomness or encryption is unavailable.
    pub fn seal(
        &self,
        key: &AeadKey,
        id: &str,
        from: &PeerId,
        to: &PeerId,
        timestamp: u64,
        body: &str,
    ) -> Result<Vec<Envelope>> {
        let plaintext = serde_json::to_vec(&Plaintext {
            timestamp,
            body: body.to_string(),
        })?;
        let (nonce, ciphertext) =
            self.provider
                .seal(key, &plaintext, &associated_data(id, from, to))?;
        let nonce = nonce.to_base64();

        let chunks: Vec<&[u8]> = ciphertext.chunks(self.max_chunk_bytes).collect();
        if chunks.len() == 1 {
            return Ok(vec![Envelope {
                id: id.to_string(),
                ciphertext: BASE64_STANDARD.encode(chunks[0]),
                nonce,
                chunk_index: None,
                chunk_count: None,
            }]);
        }

        let count = u32::try_from(chunks.len())
            .map_err(|_| PeerError::invalid_state("message too large to chunk"))?;
        Ok(chunks
            .iter()
            .zip(0u32..)
            .map(|(chunk, index)| Envelope {
                id: id.to_string(),
                ciphertext: BASE64_STANDARD.encode(chunk),
                nonce: nonce.clone(),
                chunk_index: Some(index),
                chunk_count: Some(count),
            })
            .collect())
    }

    /// Authenticate and decrypt a reassembled message from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::DecryptionFailed`] for a wrong key, tampered
    /// ciphertext, nonce or routing fields, or an undecodable plaintext.
    pub fn open(
        &self,
        key: &AeadKey,
        sealed: &SealedMessage,
        from: &PeerId,
        to: &PeerId,
    ) -> Result<OpenedMessage> {
        let plaintext = self.provider.open(
            key,
            &sealed.nonce,
            &sealed.ciphertext,
            &associated_data(&sealed.id, from, to),
        )?;
        let decoded: Plaintext =
            serde_json::from_slice(&plaintext).map_err(|_| PeerError::DecryptionFailed)?;
        Ok(OpenedMessage {
            timestamp: decoded.timestamp,
            body: decoded.body,
        })
    }
}

/// Reassembly limits
#[derive(Debug, Clone)]
pub struct ReassemblyLimits {
    /// Largest accepted message (ciphertext bytes)
    pub max_message_bytes: usize,
    /// Largest accepted chunk count
    pub max_chunk_count: u32,
    /// Partial messages held at once
    pub max_pending_messages: usize,
    /// Age after which a partial message is discarded
    pub timeout: Duration,
}

impl From<&ChannelConfig> for ReassemblyLimits {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            max_chunk_count: config.max_chunk_count,
            max_pending_messages: config.max_pending_messages,
            timeout: config.reassembly_timeout,
        }
    }
}

struct Partial {
    nonce: String,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    bytes: usize,
    started: Instant,
}

/// Per-peer chunk reassembly, keyed by (channel label, message id)
pub struct Reassembler {
    limits: ReassemblyLimits,
    partial: HashMap<(String, String), Partial>,
}

impl Reassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            partial: HashMap::new(),
        }
    }

    /// Feed one frame. Returns the sealed message once every chunk arrived.
    ///
    /// Partial messages are never returned.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Signaling`] for inconsistent, out-of-range or
    /// oversized chunks and when too many messages are pending;
    /// [`PeerError::DecryptionFailed`] for a malformed nonce.
    pub fn accept(
        &mut self,
        label: &str,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Option<SealedMessage>> {
        let data = BASE64_STANDARD
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|_| PeerError::signaling("ciphertext is not base64"))?;

        let (index, count) = match (envelope.chunk_index, envelope.chunk_count) {
            (None, None) => {
                if data.len() > self.limits.max_message_bytes {
                    return Err(PeerError::signaling("message exceeds size limit"));
                }
                return Ok(Some(SealedMessage {
                    nonce: Nonce::from_base64(&envelope.nonce)
                        .map_err(|_| PeerError::DecryptionFailed)?,
                    id: envelope.id,
                    ciphertext: data,
                }));
            }
            (Some(index), Some(count)) => (index, count),
            _ => return Err(PeerError::signaling("chunkIndex and chunkCount must appear together")),
        };

        if count == 0 || count > self.limits.max_chunk_count {
            return Err(PeerError::signaling("chunk count out of range"));
        }
        if index >= count {
            return Err(PeerError::signaling("chunk index out of range"));
        }

        let key = (label.to_string(), envelope.id.clone());
        if !self.partial.contains_key(&key) && self.partial.len() >= self.limits.max_pending_messages
        {
            return Err(PeerError::signaling("too many pending messages"));
        }

        let limits = &self.limits;
        let partial = self.partial.entry(key.clone()).or_insert_with(|| Partial {
            nonce: envelope.nonce.clone(),
            chunks: vec![None; count as usize],
            received: 0,
            bytes: 0,
            started: now,
        });

        if partial.chunks.len() != count as usize || partial.nonce != envelope.nonce {
            return Err(PeerError::signaling("chunk inconsistent with earlier chunks"));
        }
        if partial.bytes + data.len() > limits.max_message_bytes {
            self.partial.remove(&key);
            return Err(PeerError::signaling("message exceeds size limit"));
        }

        let slot = &mut partial.chunks[index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        partial.bytes += data.len();
        partial.received += 1;
        *slot = Some(data);

        if partial.received < partial.chunks.len() {
            return Ok(None);
        }

        let Some(done) = self.partial.remove(&key) else {
            return Ok(None);
        };
        let nonce = Nonce::from_base64(&done.nonce).map_err(|_| PeerError::DecryptionFailed)?;
        let ciphertext = done.chunks.into_iter().flatten().flatten().collect();

        Ok(Some(SealedMessage {
            id: envelope.id,
            nonce,
            ciphertext,
        }))
    }

    /// Discard partial messages older than the reassembly timeout.
    ///
    /// Returns the number discarded.
    pub fn prune(&mut self, now: Instant) -> usize {
        let timeout = self.limits.timeout;
        let before = self.partial.len();
        self.partial
            .retain(|_, partial| now.saturating_duration_since(partial.started) < timeout);
        let pruned = before - self.partial.len();
        if pruned > 0 {
            tracing::debug!("Discarded {} stale partial messages", pruned);
        }
        pruned
    }

    /// Drop partial messages for one channel
    pub fn forget_channel(&mut self, label: &str) {
        self.partial.retain(|(channel, _), _| channel != label);
    }

    /// Number of partial messages held
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
