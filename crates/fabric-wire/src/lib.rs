//! Fabric wire protocol: peer-to-peer overlay networking over TCP.
//!
//! Nodes exchange AMP (Application Messaging Protocol) frames: a fixed
//! 48-byte big-endian header followed by a payload of at most 4048 bytes.
//!
//! ## Architecture
//!
//! - **Message**: AMP codec (header layout, type registry, payload hashing)
//! - **Reader**: Stream framer that yields whole frames from arbitrary chunks
//! - **Peer**: Listens, dials, runs the identity handshake, dedups and
//!   dispatches inbound messages, broadcasts outbound ones
//! - **Swarm**: Keeps a peer connected to a bounded pool of remotes
//! - **PeerRegistry**: Remote nodes known by id

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod peer;
pub mod reader;
pub mod registry;
pub mod swarm;

pub use config::{load_config, FabricConfig, PeerConfig, SwarmConfig};
pub use connection::{validate_address, ConnectionInfo, Direction};
pub use error::WireError;
pub use events::PeerEvent;
pub use identity::{EmptyState, Identity, LocalIdentity, StateSource};
pub use message::{Instruction, Message, MessageError, MessageId, MessageType};
pub use peer::Peer;
pub use reader::{Frame, Reader};
pub use registry::{PeerRecord, PeerRegistry, PeerState};
pub use swarm::Swarm;
