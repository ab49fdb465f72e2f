//! Stream framer: turns arbitrarily chunked TCP reads into whole frames.
//!
//! TCP gives no message boundaries: one read may carry half a header, or
//! three frames and the start of a fourth. A [`Reader`] buffers whatever it
//! is fed and hands back complete frames in arrival order, so feeding a
//! stream one byte at a time yields exactly the same frames as feeding it
//! in one call.

use crate::message::{Header, Message, MessageError, MessageType, HEADER_SIZE};
use bytes::{Bytes, BytesMut};

/// One complete wire frame: header plus exactly `size` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    raw: Bytes,
}

impl Frame {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn kind(&self) -> MessageType {
        self.header.kind()
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// The literal frame bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Convert into a [`Message`], optionally checking the payload hash.
    pub fn to_message(&self, verify_hash: bool) -> Result<Message, MessageError> {
        let msg = Message::from_parts(self.header, self.raw.slice(HEADER_SIZE..));
        if verify_hash && !msg.verify_hash() {
            return Err(MessageError::HashMismatch);
        }
        Ok(msg)
    }
}

/// Per-connection frame accumulator.
#[derive(Debug, Default)]
pub struct Reader {
    queue: BytesMut,
}

impl Reader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the queue without extracting anything.
    pub fn push(&mut self, chunk: &[u8]) {
        self.queue.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// An error means the stream is unrecoverable (bad magic or an oversized
    /// length field) and the connection must be dropped. The queue is left
    /// untouched in that case.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, MessageError> {
        if self.queue.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = Header::parse(&self.queue[..HEADER_SIZE])?;
        let frame_len = header.frame_len();
        if self.queue.len() < frame_len {
            return Ok(None);
        }

        let raw = self.queue.split_to(frame_len).freeze();
        Ok(Some(Frame { header, raw }))
    }

    /// Append a chunk and return every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, MessageError> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}
