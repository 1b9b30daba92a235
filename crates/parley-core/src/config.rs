//! Engine configuration

use crate::error::{PeerError, Result};
use std::time::Duration;

/// Largest ciphertext slice carried by one data-channel frame. Base64 and
/// envelope overhead keep the frame under the 256 KiB SCTP message limit.
pub const MAX_FRAME_CIPHERTEXT_BYTES: usize = 192 * 1024;

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Negotiation configuration
    pub negotiation: NegotiationConfig,

    /// Data channel and codec configuration
    pub channel: ChannelConfig,

    /// Configuration handed to the connection factory
    pub rtc: RtcConfig,
}

impl EngineConfig {
    /// Check limits for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidConfig`] describing the first violated limit.
    pub fn validate(&self) -> Result<()> {
        if self.negotiation.timeout.is_zero() {
            return Err(PeerError::invalid_config("negotiation timeout must be non-zero"));
        }

        let channel = &self.channel;
        if channel.open_timeout.is_zero() {
            return Err(PeerError::invalid_config("channel open timeout must be non-zero"));
        }
        if channel.reassembly_timeout.is_zero() {
            return Err(PeerError::invalid_config("reassembly timeout must be non-zero"));
        }
        if channel.max_chunk_bytes == 0 || channel.max_chunk_bytes > MAX_FRAME_CIPHERTEXT_BYTES {
            return Err(PeerError::invalid_config(
                "max_chunk_bytes must be between 1 and 196608",
            ));
        }
        if channel.max_message_bytes < channel.max_chunk_bytes {
            return Err(PeerError::invalid_config(
                "max_message_bytes must be at least max_chunk_bytes",
            ));
        }
        if channel.max_chunk_count == 0 {
            return Err(PeerError::invalid_config("max_chunk_count must be non-zero"));
        }
        if channel.max_pending_messages == 0 {
            return Err(PeerError::invalid_config("max_pending_messages must be non-zero"));
        }

        Ok(())
    }
}

/// Negotiation configuration
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Bound on the time from connection creation to the connected state
    pub timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Data channel and secure codec configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on the wait for a channel to open
    pub open_timeout: Duration,

    /// Ciphertext bytes per chunk
    pub max_chunk_bytes: usize,

    /// Largest accepted message (ciphertext bytes)
    pub max_message_bytes: usize,

    /// Largest accepted chunk count
    pub max_chunk_count: u32,

    /// Partial messages buffered per peer before new ones are rejected
    pub max_pending_messages: usize,

    /// Partial messages older than this are discarded
    pub reassembly_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            max_chunk_bytes: 16 * 1024,      // 16 KiB
            max_message_bytes: 8 * 1024 * 1024, // 8 MiB
            max_chunk_count: 1024,
            max_pending_messages: 64,
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration passed through to the peer-connection transport
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}
