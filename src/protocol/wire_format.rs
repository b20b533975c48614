//! Wire format encoding and decoding.
//!
//! Implements the 11-byte header format:
//! ```text
//! ┌───────────┬───────────┬───────────┬───────────┐
//! │ Timestamp │ Increment │ Receptive │ Length    │
//! │ 4 bytes   │ 2 bytes   │ 1 byte    │ 4 bytes   │
//! │ uint32 BE │ uint16 BE │ 0 or 1    │ uint32 BE │
//! └───────────┴───────────┴───────────┴───────────┘
//! ```
//!
//! Timestamp and increment together form the 48-bit frame id.
//! All multi-byte integers are Big Endian.

use std::fmt;

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Default maximum body size (1 GB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Largest value a frame id can hold (48 bits).
pub const MAX_FRAME_ID: u64 = (1 << 48) - 1;

/// A 48-bit frame identifier: `(timestamp_ms as u32) << 16 | increment`.
///
/// Replies carry the id of the frame they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FrameId(u64);

impl FrameId {
    /// Id reserved for the graceful-close signal.
    pub const ZERO: FrameId = FrameId(0);

    /// Compose an id from its timestamp and increment parts.
    #[inline]
    pub const fn from_parts(timestamp: u32, increment: u16) -> Self {
        Self(((timestamp as u64) << 16) | increment as u64)
    }

    /// Build an id from a raw integer, keeping the low 48 bits.
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw & MAX_FRAME_ID)
    }

    /// The truncated millisecond timestamp part.
    #[inline]
    pub const fn timestamp(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// The rolling increment part.
    #[inline]
    pub const fn increment(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The id as an integer.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame identifier.
    pub id: FrameId,
    /// Whether the sender expects a reply with the same id.
    pub receptive: bool,
    /// Body length in bytes.
    pub body_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(id: FrameId, receptive: bool, body_length: u32) -> Self {
        Self {
            id,
            receptive,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use peerwire::protocol::{FrameId, Header};
    ///
    /// let header = Header::new(FrameId::from_parts(7, 1), true, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 11);
    /// assert_eq!(bytes[6], 1);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.id.timestamp().to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.increment().to_be_bytes());
        buf[6] = u8::from(self.receptive);
        buf[7..11].copy_from_slice(&self.body_length.to_be_bytes());
        buf
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Any non-zero receptive byte reads as `true`. Callers are responsible for
    /// having collected a full header first; the array type enforces it.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let timestamp = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let increment = u16::from_be_bytes([buf[4], buf[5]]);
        Self {
            id: FrameId::from_parts(timestamp, increment),
            receptive: buf[6] != 0,
            body_length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        }
    }

    /// Total frame size (header + body).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_length as usize
    }
}

/// Decode a header from the front of `buf`, if at least 11 bytes are present.
#[inline]
pub fn decode_header(buf: &[u8]) -> Option<Header> {
    let bytes: &[u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(Header::decode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(FrameId::from_parts(0x01020304, 0x0506), true, 0x0708090A);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..6], &[0x05, 0x06]);
        assert_eq!(bytes[6], 1);
        assert_eq!(&bytes[7..11], &[0x07, 0x08, 0x09, 0x0A]);
    }

    #[test]
    fn test_header_decode_matches_encode() {
        let header = Header::new(FrameId::from_parts(123_456, 65_535), false, 42);
        assert_eq!(Header::decode(&header.encode()), header);
    }

    #[test]
    fn test_receptive_byte_nonzero_is_true() {
        let mut bytes = Header::new(FrameId::ZERO, false, 0).encode();
        bytes[6] = 7;
        assert!(Header::decode(&bytes).receptive);
    }

    #[test]
    fn test_frame_id_parts() {
        let id = FrameId::from_parts(u32::MAX, 0xABCD);
        assert_eq!(id.timestamp(), u32::MAX);
        assert_eq!(id.increment(), 0xABCD);
        assert_eq!(id.as_u64(), MAX_FRAME_ID - 0xFFFF + 0xABCD);
    }

    #[test]
    fn test_frame_id_survives_header_for_extremes() {
        for raw in [0, 1, 0xFFFF, 0x1_0000, MAX_FRAME_ID, 0x1234_5678_9ABC] {
            let id = FrameId::from_u64(raw);
            let decoded = Header::decode(&Header::new(id, true, 0).encode());
            assert_eq!(decoded.id, id, "id {raw:#x}");
        }
    }

    #[test]
    fn test_from_u64_truncates_to_48_bits() {
        assert_eq!(FrameId::from_u64(u64::MAX).as_u64(), MAX_FRAME_ID);
    }

    #[test]
    fn test_decode_header_needs_full_header() {
        let bytes = Header::new(FrameId::from_parts(1, 2), true, 3).encode();
        assert!(decode_header(&bytes[..10]).is_none());
        assert_eq!(decode_header(&bytes).map(|h| h.body_length), Some(3));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(Header::new(FrameId::ZERO, false, 5).frame_len(), 16);
    }
}
