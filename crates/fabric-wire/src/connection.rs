//! Connection bookkeeping shared by the peer's tasks.

use crate::error::WireError;
use crate::message::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed.
    Initiator,
    /// We accepted.
    Acceptor,
}

/// Snapshot of one open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `host:port` key in the connection map.
    pub address: String,
    pub direction: Direction,
    /// Set once the remote answered our `IdentityRequest`. Advisory only.
    pub authenticated: bool,
    /// Process-unique number distinguishing reconnects to one address.
    pub session: u64,
    pub opened_at: DateTime<Utc>,
}

/// Map entry: connection info plus the queue feeding its writer task.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) info: ConnectionInfo,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
}

/// What the read task needs to answer on its own connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) address: String,
    pub(crate) session: u64,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionContext {
    pub(crate) fn send(&self, message: &Message) -> Result<(), WireError> {
        self.tx
            .send(message.to_raw())
            .map_err(|_| WireError::ConnectionClosed)
    }
}

/// Validate a `host:port` address: exactly two parts, non-empty host,
/// numeric port.
pub fn validate_address(address: &str) -> Result<(), WireError> {
    let parts: Vec<&str> = address.split(':').collect();
    match parts.as_slice() {
        [host, port] if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(WireError::AddressFormat(address.to_string())),
    }
}
