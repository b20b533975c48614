//! Protocol module - wire format, frame ids, and reserved markers.
//!
//! This module implements the binary framing shared by every connection:
//! - 11-byte header encoding/decoding
//! - 48-bit frame ids and the process-wide id generator
//! - PING / IDENTIFY / VCLOSE marker bodies

mod frame;
mod markers;
mod wire_format;

pub use frame::{
    build_frame, encode_new, now_millis, now_millis_truncated, Frame, FrameIdGenerator,
    OutboundFrame,
};
pub use markers::{Marker, IDENTIFY, PING, VCLOSE};
pub use wire_format::{
    decode_header, FrameId, Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, MAX_FRAME_ID,
};
