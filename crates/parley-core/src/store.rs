//! Persistence boundary.
//!
//! The engine does not store anything durably. It emits committed peer,
//! channel and message records to a [`MessageStore`] and accepts a
//! [`StoreSnapshot`] replay on startup.

use crate::channel::Message;
use async_trait::async_trait;
use parley_crypto::{PeerId, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Store failure. Logged by the engine; never affects peer state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Store error: {0}")]
pub struct StoreError(pub String);

/// Durable peer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Peer id
    pub id: PeerId,
    /// Verified public key
    pub public_key: PublicKey,
    /// Registry slot
    pub connection_index: u64,
}

/// Durable channel record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    /// Room the channel was opened in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Label
    pub label: String,
    /// Remote peer
    pub with_peer_id: PeerId,
}

/// Durable message record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Remote peer of the channel
    pub with_peer_id: PeerId,
    /// Channel label
    pub label: String,
    /// The message
    pub message: Message,
}

/// Everything a store replays on startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Known peers
    pub peers: Vec<PeerRecord>,
    /// Known channels
    pub channels: Vec<ChannelRecord>,
    /// Channel history
    pub messages: Vec<MessageRecord>,
}

/// External durable store
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a peer
    async fn commit_peer(&self, record: PeerRecord) -> Result<(), StoreError>;

    /// Persist a channel
    async fn commit_channel(&self, record: ChannelRecord) -> Result<(), StoreError>;

    /// Persist a message
    async fn commit_message(&self, record: MessageRecord) -> Result<(), StoreError>;

    /// Purge one channel's history
    async fn delete_channel_messages(&self, with_peer_id: &PeerId, label: &str)
    -> Result<(), StoreError>;
}

/// Store that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl MessageStore for NullStore {
    async fn commit_peer(&self, _record: PeerRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit_channel(&self, _record: ChannelRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit_message(&self, _record: MessageRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_channel_messages(
        &self,
        _with_peer_id: &PeerId,
        _label: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store, for tests and the loopback demo
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything committed so far
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.with(|s| s.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> T) -> T {
        let mut guard = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn commit_peer(&self, record: PeerRecord) -> Result<(), StoreError> {
        self.with(|s| {
            s.peers.retain(|p| p.id != record.id);
            s.peers.push(record);
        });
        Ok(())
    }

    async fn commit_channel(&self, record: ChannelRecord) -> Result<(), StoreError> {
        self.with(|s| {
            s.channels
                .retain(|c| !(c.with_peer_id == record.with_peer_id && c.label == record.label));
            s.channels.push(record);
        });
        Ok(())
    }

    async fn commit_message(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.with(|s| {
            let duplicate = s.messages.iter().any(|m| {
                m.with_peer_id == record.with_peer_id
                    && m.label == record.label
                    && m.message.id == record.message.id
            });
            if !duplicate {
                s.messages.push(record);
            }
        });
        Ok(())
    }

    async fn delete_channel_messages(
        &self,
        with_peer_id: &PeerId,
        label: &str,
    ) -> Result<(), StoreError> {
        self.with(|s| {
            s.messages
                .retain(|m| !(&m.with_peer_id == with_peer_id && m.label == label));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::parse("0123456789abcdef0123456789abcdef").unwrap()
    }

    fn record(label: &str, id: &str) -> MessageRecord {
        MessageRecord {
            with_peer_id: peer(),
            label: label.into(),
            message: Message {
                id: id.into(),
                message: "hi".into(),
                from_peer_id: peer(),
                to_peer_id: peer(),
                timestamp: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_memory_store_dedups_and_deletes() {
        let store = MemoryStore::new();
        store.commit_message(record("a", "1")).await.unwrap();
        store.commit_message(record("a", "1")).await.unwrap();
        store.commit_message(record("b", "2")).await.unwrap();
        assert_eq!(store.snapshot().messages.len(), 2);

        store.delete_channel_messages(&peer(), "a").await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].label, "b");
    }

    #[test]
    fn test_snapshot_serde() {
        let snapshot = StoreSnapshot {
            messages: vec![record("chat", "1")],
            ..StoreSnapshot::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("withPeerId"));
        assert_eq!(serde_json::from_str::<StoreSnapshot>(&json).unwrap(), snapshot);
    }
}
