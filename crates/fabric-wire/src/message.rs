//! AMP message envelope.
//!
//! Every frame on the wire is a fixed 48-byte header followed by the payload:
//!
//! ```text
//! magic(4) | version(4) | type(4) | size(4) | hash(32) | payload(size)
//! ```
//!
//! All integers are big-endian. `hash` is `sha256(payload)` and the message
//! id is `sha256(header ++ payload)`, which makes ids content-addressed and
//! reproducible on every node.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Magic number opening every frame.
pub const MAGIC: u32 = 0xC0D3_F33D;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 0x01;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 48;

/// Maximum size of a whole frame (header + payload).
pub const MAX_FRAME_SIZE: usize = 4096;

/// Maximum payload size.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Errors raised while building or parsing messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Corrupt header: bad magic 0x{magic:08X}")]
    CorruptHeader { magic: u32 },
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Payload hash does not match header")]
    HashMismatch,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Root,
    IdentityRequest,
    IdentityResponse,
    Ping,
    Pong,
    PeerInstruction,
    StartChain,
    StateRequest,
    StateRoot,
    PeerMessage,
    StateCommitment,
    StateChange,
    Transaction,
    Call,
    /// Fallback for names missing from the registry.
    Generic,
    /// A code received on the wire that this node does not know.
    Unknown(u32),
}

impl MessageType {
    /// Every named type, in code order.
    pub const KNOWN: [MessageType; 15] = [
        MessageType::Root,
        MessageType::IdentityRequest,
        MessageType::IdentityResponse,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::PeerInstruction,
        MessageType::StartChain,
        MessageType::StateRequest,
        MessageType::StateRoot,
        MessageType::PeerMessage,
        MessageType::StateCommitment,
        MessageType::StateChange,
        MessageType::Transaction,
        MessageType::Call,
        MessageType::Generic,
    ];

    /// The 32-bit wire code.
    pub fn code(self) -> u32 {
        match self {
            MessageType::Root => 0x0000_0000,
            MessageType::IdentityRequest => 0x0000_0001,
            MessageType::IdentityResponse => 0x0000_0011,
            MessageType::Ping => 0x0000_0012,
            MessageType::Pong => 0x0000_0013,
            MessageType::PeerInstruction => 0x0000_0020,
            MessageType::StartChain => 0x0000_0021,
            MessageType::StateRequest => 0x0000_0029,
            MessageType::StateRoot => 0x0000_0030,
            MessageType::PeerMessage => 0x0000_0031,
            MessageType::StateCommitment => 0x0000_0032,
            MessageType::StateChange => 0x0000_0033,
            MessageType::Transaction => 0x0000_0039,
            MessageType::Call => 0x0000_0042,
            MessageType::Generic => 0x8000_0000,
            MessageType::Unknown(code) => code,
        }
    }

    /// Map a wire code back to a type. Never fails.
    pub fn from_code(code: u32) -> Self {
        Self::KNOWN
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .unwrap_or(MessageType::Unknown(code))
    }

    /// Look up a registry name such as `"IdentityRequest"`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::KNOWN.iter().copied().find(|t| t.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Root => "Root",
            MessageType::IdentityRequest => "IdentityRequest",
            MessageType::IdentityResponse => "IdentityResponse",
            MessageType::Ping => "Ping",
            MessageType::Pong => "Pong",
            MessageType::PeerInstruction => "PeerInstruction",
            MessageType::StartChain => "StartChain",
            MessageType::StateRequest => "StateRequest",
            MessageType::StateRoot => "StateRoot",
            MessageType::PeerMessage => "PeerMessage",
            MessageType::StateCommitment => "StateCommitment",
            MessageType::StateChange => "StateChange",
            MessageType::Transaction => "Transaction",
            MessageType::Call => "Call",
            MessageType::Generic => "Generic",
            MessageType::Unknown(_) => "Unknown",
        }
    }

    /// Types that only make sense on the connection they arrived on
    /// (handshake and liveness). Their dedup key is scoped to the session.
    pub fn is_session_scoped(self) -> bool {
        matches!(
            self,
            MessageType::IdentityRequest
                | MessageType::IdentityResponse
                | MessageType::StateRoot
                | MessageType::Ping
                | MessageType::Pong
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown(code) => write!(f, "Unknown(0x{code:08X})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Content-addressed message identifier: `sha256(header ++ payload)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

/// The decoded 48-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub code: u32,
    pub size: u32,
    pub hash: [u8; 32],
}

impl Header {
    /// Parse and validate a header from the first 48 bytes of `buf`.
    ///
    /// Checks the magic number and the payload size bound; does not look at
    /// any payload bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < HEADER_SIZE {
            return Err(MessageError::Truncated {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let magic = be_u32(buf, 0);
        if magic != MAGIC {
            return Err(MessageError::CorruptHeader { magic });
        }

        let size = be_u32(buf, 12);
        if size as usize > MAX_MESSAGE_SIZE {
            return Err(MessageError::PayloadTooLarge {
                size: size as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[16..HEADER_SIZE]);

        Ok(Self {
            magic,
            version: be_u32(buf, 4),
            code: be_u32(buf, 8),
            size,
            hash,
        })
    }

    /// Encode the header in wire order.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..12].copy_from_slice(&self.code.to_be_bytes());
        out[12..16].copy_from_slice(&self.size.to_be_bytes());
        out[16..HEADER_SIZE].copy_from_slice(&self.hash);
        out
    }

    pub fn kind(&self) -> MessageType {
        MessageType::from_code(self.code)
    }

    /// Total frame length described by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// An immutable AMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    payload: Bytes,
}

impl Message {
    /// Build a message of the given type.
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Result<Self, MessageError> {
        let payload = payload.into();
        check_size(payload.len())?;
        Ok(Self {
            header: Header {
                magic: MAGIC,
                version: PROTOCOL_VERSION,
                code: kind.code(),
                size: payload.len() as u32,
                hash: sha256(&payload),
            },
            payload,
        })
    }

    /// Build a message from a `(type name, payload)` pair.
    ///
    /// Names missing from the registry fall back to [`MessageType::Generic`].
    pub fn from_vector(type_name: &str, payload: impl Into<Bytes>) -> Result<Self, MessageError> {
        let kind = MessageType::from_name(type_name).unwrap_or(MessageType::Generic);
        Self::new(kind, payload)
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(kind: MessageType, value: &T) -> Result<Self, MessageError> {
        Self::new(kind, serde_json::to_vec(value)?)
    }

    /// Parse a frame and verify the payload hash.
    pub fn from_raw(raw: &[u8]) -> Result<Self, MessageError> {
        let msg = Self::from_raw_unverified(raw)?;
        if !msg.verify_hash() {
            return Err(MessageError::HashMismatch);
        }
        Ok(msg)
    }

    /// Parse a frame without checking the payload hash.
    ///
    /// Bytes past `48 + size` are ignored.
    pub fn from_raw_unverified(raw: &[u8]) -> Result<Self, MessageError> {
        let header = Header::parse(raw)?;
        let end = header.frame_len();
        if raw.len() < end {
            return Err(MessageError::Truncated {
                expected: end,
                actual: raw.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&raw[HEADER_SIZE..end]),
        })
    }

    /// Assemble a message from an already-validated header and its payload.
    pub(crate) fn from_parts(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Serialize to the wire format.
    pub fn to_raw(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.frame_len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.header.encode());
        hasher.update(&self.payload);
        MessageId(hasher.finalize().into())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn kind(&self) -> MessageType {
        self.header.kind()
    }

    pub fn code(&self) -> u32 {
        self.header.code
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.header.hash
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the header hash matches the payload digest.
    pub fn verify_hash(&self) -> bool {
        sha256(&self.payload) == self.header.hash
    }

    pub fn payload_str(&self) -> Result<&str, MessageError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Replace the payload, recomputing `size` and `hash`.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> Result<(), MessageError> {
        let payload = payload.into();
        check_size(payload.len())?;
        self.header.size = payload.len() as u32;
        self.header.hash = sha256(&payload);
        self.payload = payload;
        Ok(())
    }
}

fn check_size(len: usize) -> Result<(), MessageError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(MessageError::PayloadTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Control instructions carried in `PeerInstruction` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Instruction {
    /// Advertise an address other nodes may dial.
    PeerCandidate { address: String },
}
