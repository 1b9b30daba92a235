//! Data channels and their message history.

use crate::transport::DataChannel;
use parley_crypto::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// One application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 32 hex characters, unique within the channel
    pub id: String,
    /// Plaintext body
    pub message: String,
    /// Sender
    pub from_peer_id: PeerId,
    /// Recipient
    pub to_peer_id: PeerId,
    /// Sender clock, ms since Unix epoch
    pub timestamp: u64,
}

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the transport to open it
    Opening,
    /// Frames can flow
    Open,
    /// Closed; history is kept until deleted
    Closed,
}

/// Channel record: identity is `(with_peer_id, label)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Room the channel was opened in
    pub room_id: Option<String>,
    /// Label
    pub label: String,
    /// Remote peer
    pub with_peer_id: PeerId,
    /// Lifecycle state
    pub state: ChannelState,
    messages: Vec<Message>,
    seen: HashSet<String>,
}

impl Channel {
    /// Create an empty channel in the `Opening` state
    #[must_use]
    pub fn new(room_id: Option<String>, label: impl Into<String>, with_peer_id: PeerId) -> Self {
        Self {
            room_id,
            label: label.into(),
            with_peer_id,
            state: ChannelState::Opening,
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Messages ordered by `(timestamp, id)`
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Insert a message in order. Returns `false` for a duplicate id.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        let position = self.messages.partition_point(|m| {
            (m.timestamp, m.id.as_str()) < (message.timestamp, message.id.as_str())
        });
        self.messages.insert(position, message);
        true
    }

    /// Drop all history
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.seen.clear();
    }
}

/// Live channel: record, transport handle and an open-state broadcast
pub struct ChannelEntry {
    channel: Channel,
    handle: Option<Arc<dyn DataChannel>>,
    state: watch::Sender<ChannelState>,
}

impl ChannelEntry {
    fn new(channel: Channel) -> Self {
        let (state, _) = watch::channel(channel.state);
        Self {
            channel,
            handle: None,
            state,
        }
    }

    /// The record
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Mutable record
    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Transport handle, once created or received
    #[must_use]
    pub fn handle(&self) -> Option<&Arc<dyn DataChannel>> {
        self.handle.as_ref()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&mut self, state: ChannelState) -> bool {
        if self.channel.state == state {
            return false;
        }
        self.channel.state = state;
        self.state.send_replace(state);
        true
    }
}

/// Channels of one peer, keyed by label
#[derive(Default)]
pub struct ChannelTable {
    entries: HashMap<String, ChannelEntry>,
}

impl ChannelTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `label`.
    ///
    /// A closed channel is reset to `Opening` with its history kept.
    pub fn prepare(
        &mut self,
        label: &str,
        room_id: Option<String>,
        with_peer_id: &PeerId,
    ) -> &mut ChannelEntry {
        let entry = self.entries.entry(label.to_string()).or_insert_with(|| {
            ChannelEntry::new(Channel::new(room_id.clone(), label, with_peer_id.clone()))
        });
        if entry.channel.state == ChannelState::Closed {
            entry.handle = None;
            entry.set_state(ChannelState::Opening);
        }
        if entry.channel.room_id.is_none() {
            entry.channel.room_id = room_id;
        }
        entry
    }

    /// Attach a transport handle to `label`, creating the entry if needed
    pub fn attach(
        &mut self,
        handle: Arc<dyn DataChannel>,
        room_id: Option<String>,
        with_peer_id: &PeerId,
    ) -> &mut ChannelEntry {
        let label = handle.label().to_string();
        let entry = self.prepare(&label, room_id, with_peer_id);
        entry.handle = Some(handle);
        entry
    }

    /// Get or create a closed entry for `label`, for history replay
    pub fn restore(
        &mut self,
        label: &str,
        room_id: Option<String>,
        with_peer_id: &PeerId,
    ) -> &mut Channel {
        let entry = self.entries.entry(label.to_string()).or_insert_with(|| {
            let mut channel = Channel::new(room_id.clone(), label, with_peer_id.clone());
            channel.state = ChannelState::Closed;
            ChannelEntry::new(channel)
        });
        if entry.channel.room_id.is_none() {
            entry.channel.room_id = room_id;
        }
        &mut entry.channel
    }

    /// Mark `label` open. Returns `true` on an actual transition.
    pub fn mark_open(&mut self, label: &str) -> bool {
        self.entries
            .get_mut(label)
            .is_some_and(|entry| entry.set_state(ChannelState::Open))
    }

    /// Mark `label` closed and drop its handle. Returns `true` on an actual
    /// transition.
    pub fn mark_closed(&mut self, label: &str) -> bool {
        self.entries.get_mut(label).is_some_and(|entry| {
            entry.handle = None;
            entry.set_state(ChannelState::Closed)
        })
    }

    /// Close every channel, returning the labels that transitioned and the
    /// handles to close.
    pub fn close_all(&mut self) -> Vec<(String, Option<Arc<dyn DataChannel>>)> {
        self.entries
            .iter_mut()
            .filter(|(_, entry)| entry.channel.state != ChannelState::Closed)
            .map(|(label, entry)| {
                let handle = entry.handle.take();
                entry.set_state(ChannelState::Closed);
                (label.clone(), handle)
            })
            .collect()
    }

    /// Entry for `label`
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&ChannelEntry> {
        self.entries.get(label)
    }

    /// Mutable entry for `label`
    pub fn get_mut(&mut self, label: &str) -> Option<&mut ChannelEntry> {
        self.entries.get_mut(label)
    }

    /// Remove `label` entirely
    pub fn remove(&mut self, label: &str) -> Option<ChannelEntry> {
        self.entries.remove(label)
    }

    /// Snapshot of every channel record, ordered by label
    #[must_use]
    pub fn snapshots(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> =
            self.entries.values().map(|e| e.channel.clone()).collect();
        channels.sort_by(|a, b| a.label.cmp(&b.label));
        channels
    }

    /// Number of channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no channels
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
