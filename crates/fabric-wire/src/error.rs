//! Errors from the networking layer.

use crate::message::MessageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),
    #[error("Invalid address '{0}': expected host:port")]
    AddressFormat(String),
    #[error("Peer already started")]
    AlreadyStarted,
    #[error("Peer is shutting down")]
    ShuttingDown,
    #[error("Connected to self")]
    SelfConnection,
    #[error("Connection closed")]
    ConnectionClosed,
}

impl WireError {
    /// Whether the remote broke the protocol (as opposed to a socket failure).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, WireError::Protocol(_) | WireError::Json(_))
    }
}
