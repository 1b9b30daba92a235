//! Configuration system for the Parley CLI.

use parley_core::config::MAX_FRAME_CIPHERTEXT_BYTES;
use parley_core::{ChannelConfig, EngineConfig, NegotiationConfig, RtcConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Parley configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,
    /// Negotiation configuration
    #[serde(default)]
    pub negotiation: NegotiationSection,
    /// Channel configuration
    #[serde(default)]
    pub channel: ChannelSection,
    /// Peer connection configuration
    #[serde(default)]
    pub rtc: RtcSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Room URL; hashed into the room id
    #[serde(default = "default_room_url")]
    pub room_url: String,
}

/// Negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSection {
    /// Seconds from connection creation until negotiation is abandoned
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_secs: u64,
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Seconds to wait for a channel to open
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    /// Ciphertext bytes per frame
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    /// Largest accepted message
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Largest accepted chunk count
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: u32,
    /// Partial messages buffered per peer
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    /// Seconds before a partial message is discarded
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout_secs: u64,
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcSection {
    /// STUN/TURN server URLs
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_relay_url() -> String {
    "wss://relay.parley.local/ws".to_string()
}

fn default_room_url() -> String {
    "https://parley.local/room/lobby".to_string()
}

fn default_negotiation_timeout() -> u64 {
    NegotiationConfig::default().timeout.as_secs()
}

fn default_open_timeout() -> u64 {
    ChannelConfig::default().open_timeout.as_secs()
}

fn default_max_chunk_bytes() -> usize {
    ChannelConfig::default().max_chunk_bytes
}

fn default_max_message_bytes() -> usize {
    ChannelConfig::default().max_message_bytes
}

fn default_max_chunk_count() -> u32 {
    ChannelConfig::default().max_chunk_count
}

fn default_max_pending_messages() -> usize {
    ChannelConfig::default().max_pending_messages
}

fn default_reassembly_timeout() -> u64 {
    ChannelConfig::default().reassembly_timeout.as_secs()
}

fn default_ice_servers() -> Vec<String> {
    RtcConfig::default().ice_servers
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            room_url: default_room_url(),
        }
    }
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_negotiation_timeout(),
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_timeout(),
            max_chunk_bytes: default_max_chunk_bytes(),
            max_message_bytes: default_max_message_bytes(),
            max_chunk_count: default_max_chunk_count(),
            max_pending_messages: default_max_pending_messages(),
            reassembly_timeout_secs: default_reassembly_timeout(),
        }
    }
}

impl Default for RtcSection {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("parley/config.toml")
    }

    /// Load config from `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            negotiation: NegotiationConfig {
                timeout: Duration::from_secs(self.negotiation.timeout_secs),
            },
            channel: ChannelConfig {
                open_timeout: Duration::from_secs(self.channel.open_timeout_secs),
                max_chunk_bytes: self.channel.max_chunk_bytes,
                max_message_bytes: self.channel.max_message_bytes,
                max_chunk_count: self.channel.max_chunk_count,
                max_pending_messages: self.channel.max_pending_messages,
                reassembly_timeout: Duration::from_secs(self.channel.reassembly_timeout_secs),
            },
            rtc: RtcConfig {
                ice_servers: self.rtc.ice_servers.clone(),
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let relay = Url::parse(&self.signaling.relay_url)
            .map_err(|e| anyhow::anyhow!("Invalid relay URL '{}': {}", self.signaling.relay_url, e))?;
        if !matches!(relay.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "Relay URL must use ws:// or wss://, got {}://",
                relay.scheme()
            );
        }

        Url::parse(&self.signaling.room_url)
            .map_err(|e| anyhow::anyhow!("Invalid room URL '{}': {}", self.signaling.room_url, e))?;

        for server in &self.rtc.ice_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:") || server.starts_with("turns:")) {
                anyhow::bail!("ICE server '{}' must be a stun:, turn: or turns: URL", server);
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.channel.max_chunk_bytes > MAX_FRAME_CIPHERTEXT_BYTES {
            anyhow::bail!(
                "max_chunk_bytes must be at most {} to fit one frame",
                MAX_FRAME_CIPHERTEXT_BYTES
            );
        }

        self.to_engine_config().validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.negotiation.timeout_secs, 30);
        assert_eq!(config.channel.open_timeout_secs, 10);
        assert_eq!(config.channel.max_chunk_bytes, 16 * 1024);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.signaling.relay_url = "https://relay.example".to_string();
        assert!(config.validate().is_err());

        config.signaling.relay_url = default_relay_url();
        config.channel.max_chunk_bytes = 0;
        assert!(config.validate().is_err());

        config.channel.max_chunk_bytes = default_max_chunk_bytes();
        config.rtc.ice_servers = vec!["http://stun.example".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [channel]
            max_chunk_bytes = 4096

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.max_chunk_bytes, 4096);
        assert_eq!(config.channel.max_chunk_count, default_max_chunk_count());
        assert_eq!(config.signaling.relay_url, default_relay_url());
        assert_eq!(
            config.to_engine_config().channel.max_chunk_bytes,
            4096
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.negotiation.timeout_secs = 5;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.negotiation.timeout_secs, 5);
        assert_eq!(
            loaded.to_engine_config().negotiation.timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.rtc.ice_servers, default_ice_servers());
    }
}
