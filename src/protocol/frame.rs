//! Frame building and id minting.
//!
//! A frame is the 11-byte header followed by the serialized body. Fresh ids
//! come from a [`FrameIdGenerator`]; replies reuse the id they answer.
//!
//! # Example
//!
//! ```
//! use peerwire::protocol::{build_frame, decode_header, FrameIdGenerator};
//!
//! let ids = FrameIdGenerator::new();
//! let id = ids.next_id();
//! let bytes = build_frame(id, true, b"hello");
//!
//! let header = decode_header(&bytes).unwrap();
//! assert_eq!(header.id, id);
//! assert!(header.receptive);
//! assert_eq!(header.body_length, 5);
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::wire_format::{FrameId, Header, HEADER_SIZE};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    /// Frame id (shared by a request and its reply).
    pub id: FrameId,
    /// Whether the sender waits for a reply.
    pub receptive: bool,
    /// Decoded body.
    pub data: T,
}

/// Mints frame ids from the wall clock and a rolling 16-bit counter.
///
/// The counter wraps from 65535 back to 0. Ids are unique only within the
/// same millisecond and counter window; there is no cross-process guarantee.
/// One generator is shared by every connection of a node.
#[derive(Debug, Default)]
pub struct FrameIdGenerator {
    increment: AtomicU16,
}

impl FrameIdGenerator {
    /// Create a generator with the counter at 0.
    pub const fn new() -> Self {
        Self {
            increment: AtomicU16::new(0),
        }
    }

    /// Mint the next id.
    pub fn next_id(&self) -> FrameId {
        let increment = self.increment.fetch_add(1, Ordering::Relaxed);
        FrameId::from_parts(now_millis_truncated(), increment)
    }
}

/// Current wall-clock milliseconds truncated to 32 bits.
pub fn now_millis_truncated() -> u32 {
    now_millis() as u32
}

/// Current wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a complete frame with a caller-supplied id.
///
/// Used for replies and the handshake answer, which echo the inbound id.
pub fn build_frame(id: FrameId, receptive: bool, body: &[u8]) -> Vec<u8> {
    let header = Header::new(id, receptive, body.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

/// Build a complete frame with a freshly minted id.
///
/// Returns the id alongside the bytes so the caller can correlate a reply.
pub fn encode_new(ids: &FrameIdGenerator, receptive: bool, body: &[u8]) -> (FrameId, Vec<u8>) {
    let id = ids.next_id();
    (id, build_frame(id, receptive, body))
}

/// A frame ready to be handed to the writer task.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header (11 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body bytes.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Create an outbound frame.
    #[inline]
    pub fn new(id: FrameId, receptive: bool, body: Bytes) -> Self {
        Self {
            header: Header::new(id, receptive, body.len() as u32).encode(),
            body,
        }
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}
