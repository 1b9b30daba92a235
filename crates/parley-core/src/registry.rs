//! Rooms and peers.
//!
//! The registry is the single owner of per-peer state. Lookups hand out
//! `Arc<PeerEntry>` clones so no map lock is ever held across an await;
//! all mutation of a peer goes through its session mutex.

use crate::channel::Channel;
use crate::codec::ReassemblyLimits;
use crate::session::PeerSession;
use dashmap::{DashMap, DashSet};
use parley_crypto::hash::Kdf;
use parley_crypto::{PeerId, PublicKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, watch};

/// KDF context for room ids
pub const ROOM_ID_CONTEXT: &str = "parley:room:v1";

/// Room id length in bytes (hex encoded)
pub const ROOM_ID_BYTES: usize = 16;

/// A joined room
#[derive(Debug)]
pub struct Room {
    url: String,
    id: OnceLock<String>,
    members: DashSet<PeerId>,
}

impl Room {
    /// Create a room for `url`. The id is derived on first use.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: OnceLock::new(),
            members: DashSet::new(),
        }
    }

    /// Room URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Room id: a keyed hash of the URL
    pub fn id(&self) -> &str {
        self.id
            .get_or_init(|| Kdf::new(ROOM_ID_CONTEXT).derive_hex(self.url.as_bytes(), ROOM_ID_BYTES))
    }

    /// Whether the id has been derived yet
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.id.get().is_some()
    }

    /// Whether `peer` is a member
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Current members
    #[must_use]
    pub fn members(&self) -> Vec<PeerId> {
        self.members.iter().map(|p| p.key().clone()).collect()
    }
}

/// A known remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Peer id
    pub id: PeerId,
    /// Verified public key
    pub public_key: PublicKey,
    /// Registry slot, assigned on insertion
    pub connection_index: u64,
}

/// Registry slot for one peer
pub struct PeerEntry {
    peer: Peer,
    session: Mutex<PeerSession>,
    cancel: watch::Sender<bool>,
}

impl PeerEntry {
    /// Peer record
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Session state
    #[must_use]
    pub fn session(&self) -> &Mutex<PeerSession> {
        &self.session
    }

    /// Watch that flips to `true` once the peer is removed
    #[must_use]
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Whether the peer has been removed
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Outcome of a peer removal
#[derive(Debug)]
pub struct RemovedPeer {
    /// The removed peer
    pub peer: Peer,
    /// Channels that were open or opening
    pub closed_channels: Vec<String>,
}

/// Rooms and peers of one engine
pub struct Registry {
    local: PeerId,
    limits: ReassemblyLimits,
    rooms: DashMap<String, Arc<Room>>,
    peers: DashMap<PeerId, Arc<PeerEntry>>,
    next_index: AtomicU64,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new(local: PeerId, limits: ReassemblyLimits) -> Self {
        Self {
            local,
            limits,
            rooms: DashMap::new(),
            peers: DashMap::new(),
            next_index: AtomicU64::new(0),
        }
    }

    // ============ Rooms ============

    /// Join the room at `url`; joining twice returns the same room
    pub fn join_room(&self, url: &str) -> Arc<Room> {
        self.rooms
            .entry(url.to_string())
            .or_insert_with(|| {
                tracing::info!("Joined room {}", url);
                Arc::new(Room::new(url))
            })
            .clone()
    }

    /// Room with id `room_id`
    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .iter()
            .find(|room| room.id() == room_id)
            .map(|room| room.value().clone())
    }

    /// Leave a room. Returns its members, or `None` if not joined.
    pub fn leave_room(&self, room_id: &str) -> Option<Vec<PeerId>> {
        let url = self.room(room_id)?.url().to_string();
        let (_, room) = self.rooms.remove(&url)?;
        tracing::info!("Left room {}", url);
        Some(room.members())
    }

    /// Joined rooms
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Ids of the rooms `peer` is a member of
    #[must_use]
    pub fn rooms_of(&self, peer: &PeerId) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|room| room.contains(peer))
            .map(|room| room.id().to_string())
            .collect()
    }

    // ============ Peers ============

    /// Insert `peer` if unknown and add it to `room_id` if that room is
    /// joined. Returns the (possibly existing) entry.
    pub fn add_peer(
        &self,
        id: &PeerId,
        public_key: PublicKey,
        room_id: Option<&str>,
    ) -> Arc<PeerEntry> {
        if let Some(room) = room_id.and_then(|r| self.room(r)) {
            room.members.insert(id.clone());
        }

        self.peers
            .entry(id.clone())
            .or_insert_with(|| {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                self.new_entry(id, public_key, room_id.map(str::to_string), index)
            })
            .clone()
    }

    /// Re-insert a peer from a store snapshot, keeping its slot.
    pub fn restore_peer(&self, id: &PeerId, public_key: PublicKey, index: u64) -> Arc<PeerEntry> {
        self.next_index.fetch_max(index.saturating_add(1), Ordering::Relaxed);
        self.peers
            .entry(id.clone())
            .or_insert_with(|| self.new_entry(id, public_key, None, index))
            .clone()
    }

    fn new_entry(
        &self,
        id: &PeerId,
        public_key: PublicKey,
        room_id: Option<String>,
        index: u64,
    ) -> Arc<PeerEntry> {
        let (cancel, cancel_rx) = watch::channel(false);
        let session = PeerSession::new(
            self.local.clone(),
            id.clone(),
            public_key,
            room_id,
            self.limits.clone(),
            cancel_rx,
        );
        tracing::debug!("Registered peer {} at slot {}", id.short(), index);
        Arc::new(PeerEntry {
            peer: Peer {
                id: id.clone(),
                public_key,
                connection_index: index,
            },
            session: Mutex::new(session),
            cancel,
        })
    }

    /// Entry for `id`
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerEntry>> {
        self.peers.get(id).map(|e| e.value().clone())
    }

    /// Peer record for `id`
    #[must_use]
    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.get(id).map(|e| e.peer.clone())
    }

    /// All known peers, ordered by slot
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.peer.clone()).collect();
        peers.sort_by_key(|p| p.connection_index);
        peers
    }

    /// Members of `room_id`
    #[must_use]
    pub fn peers_in_room(&self, room_id: &str) -> Vec<PeerId> {
        self.room(room_id).map(|r| r.members()).unwrap_or_default()
    }

    /// Snapshot of `id`'s channels
    pub async fn channels_for_peer(&self, id: &PeerId) -> Vec<Channel> {
        match self.get(id) {
            Some(entry) => entry.session.lock().await.channels().snapshots(),
            None => Vec::new(),
        }
    }

    /// Remove `id` and release every resource it holds.
    ///
    /// In-flight operations on the peer observe the cancel signal and stop.
    /// Returns `None` if the peer was unknown.
    pub async fn remove_peer(&self, id: &PeerId) -> Option<RemovedPeer> {
        let (_, entry) = self.peers.remove(id)?;
        for room in &self.rooms {
            room.members.remove(id);
        }
        entry.cancel.send_replace(true);

        let closed_channels = entry.session.lock().await.shutdown().await;
        tracing::debug!(
            "Removed peer {} ({} channels closed)",
            id.short(),
            closed_channels.len()
        );
        Some(RemovedPeer {
            peer: entry.peer.clone(),
            closed_channels,
        })
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
