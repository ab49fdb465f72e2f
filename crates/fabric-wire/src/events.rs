//! Typed events published by a [`Peer`](crate::peer::Peer).
//!
//! Subscribers receive them over a `tokio::sync::broadcast` channel; a slow
//! subscriber lags and skips events rather than blocking the peer.

use crate::message::{Message, MessageType};
use crate::registry::PeerRecord;
use serde_json::Value;
use std::net::SocketAddr;

/// Events emitted by a peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The listener is bound.
    Ready { id: String, address: SocketAddr },
    /// A previously unseen peer completed the handshake.
    Peer(PeerRecord),
    /// A remote advertised an address worth dialing.
    PeerCandidate { address: String },
    /// An application message for external listeners.
    Message { address: String, message: Message },
    /// A `collections:post` peer message.
    CollectionPost { address: String, body: Value },
    /// A state message (root, commitment, change, request), parsed but not
    /// interpreted.
    State {
        address: String,
        kind: MessageType,
        body: Value,
    },
    ConnectionOpen {
        address: String,
        status: &'static str,
        initiator: bool,
    },
    ConnectionClose { address: String },
    ConnectionError { address: String, error: String },
    /// The session's handshake status changed.
    SessionUpdate { address: String, authenticated: bool },
    /// A complete frame arrived.
    SocketData { address: String, size: usize },
}

impl PeerEvent {
    /// Stable event name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::Ready { .. } => "ready",
            PeerEvent::Peer(_) => "peer",
            PeerEvent::PeerCandidate { .. } => "peer:candidate",
            PeerEvent::Message { .. } => "message",
            PeerEvent::CollectionPost { .. } => "collections:post",
            PeerEvent::State { .. } => "state",
            PeerEvent::ConnectionOpen { .. } => "connections:open",
            PeerEvent::ConnectionClose { .. } => "connections:close",
            PeerEvent::ConnectionError { .. } => "connection:error",
            PeerEvent::SessionUpdate { .. } => "session:update",
            PeerEvent::SocketData { .. } => "socket:data",
        }
    }
}
