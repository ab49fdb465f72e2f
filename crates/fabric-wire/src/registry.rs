//! Peer registry: records every remote node that completed a handshake.
//!
//! The [`PeerRegistry`] is a thread-safe map from peer id to [`PeerRecord`].
//! Records are created when an `IdentityResponse` arrives and are never
//! evicted; a closed connection only marks its record `Disconnected`, so
//! the swarm can tell live peers from ones worth redialing.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Handshake completed and the connection is open.
    Connected,
    /// Connection lost; record kept for reconnection.
    Disconnected,
}

/// A remote node known by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Id advertised in the remote's `IdentityResponse`.
    pub id: String,
    /// `host:port` of the connection the handshake ran on.
    pub address: String,
    pub state: PeerState,
    /// When the peer last completed a handshake.
    pub connected_at: DateTime<Utc>,
}

/// Outcome of [`PeerRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First time this id was seen.
    New(PeerRecord),
    /// Id was known but disconnected; now connected again.
    Reconnected(PeerRecord),
    /// Id was already connected.
    Known,
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer after a successful handshake on `address`.
    pub fn register(&self, id: &str, address: &str) -> Registration {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(id) {
            Some(entry) if entry.state == PeerState::Connected && entry.address == address => {
                Registration::Known
            }
            Some(entry) => {
                entry.address = address.to_string();
                entry.state = PeerState::Connected;
                entry.connected_at = Utc::now();
                Registration::Reconnected(entry.clone())
            }
            None => {
                let record = PeerRecord {
                    id: id.to_string(),
                    address: address.to_string(),
                    state: PeerState::Connected,
                    connected_at: Utc::now(),
                };
                peers.insert(id.to_string(), record.clone());
                Registration::New(record)
            }
        }
    }

    /// Mark every peer registered at `address` as disconnected.
    ///
    /// Returns the ids that changed state.
    pub fn mark_address_disconnected(&self, address: &str) -> Vec<String> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .values_mut()
            .filter(|p| p.address == address && p.state == PeerState::Connected)
            .map(|p| {
                p.state = PeerState::Disconnected;
                p.id.clone()
            })
            .collect()
    }

    pub fn get_peer(&self, id: &str) -> Option<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(id).cloned()
    }

    /// Get all connected peers.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect()
    }

    /// Addresses of every connected peer.
    pub fn connected_addresses(&self) -> HashSet<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.address.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Total number of peers (including disconnected).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}
