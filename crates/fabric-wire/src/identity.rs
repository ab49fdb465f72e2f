//! Boundary traits for node identity and local state.
//!
//! Key management and chain state live outside this crate. A [`Peer`]
//! only needs a stable id to advertise during the handshake and a JSON
//! snapshot to answer with once a remote identifies itself.
//!
//! [`Peer`]: crate::peer::Peer

use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Supplies the id a node advertises in `IdentityRequest`/`IdentityResponse`.
pub trait Identity: Send + Sync + 'static {
    fn id(&self) -> String;
}

/// Supplies the snapshot sent as `StateRoot` after a successful handshake.
pub trait StateSource: Send + Sync + 'static {
    fn snapshot(&self) -> Value;
}

/// A fixed identity, either configured or randomly generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    id: String,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Generate a fresh id: hex-encoded sha256 of 32 random bytes.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            id: hex::encode(Sha256::digest(seed)),
        }
    }
}

impl Identity for LocalIdentity {
    fn id(&self) -> String {
        self.id.clone()
    }
}

/// State source for nodes with nothing to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyState;

impl StateSource for EmptyState {
    fn snapshot(&self) -> Value {
        Value::Object(Default::default())
    }
}

impl<F> StateSource for F
where
    F: Fn() -> Value + Send + Sync + 'static,
{
    fn snapshot(&self) -> Value {
        self()
    }
}
