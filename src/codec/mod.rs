//! Codec module - the serialization boundary for frame bodies.
//!
//! - [`Value`] - the application value model
//! - [`Codec`] - pluggable body encoding
//! - [`TaggedCodec`] - default type-tagged binary format
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`
//!
//! # Example
//!
//! ```
//! use peerwire::codec::{Codec, TaggedCodec, Value};
//!
//! let codec = TaggedCodec;
//! let encoded = Codec::encode(&codec, &Value::from("hello")).unwrap();
//! let decoded = Codec::decode(&codec, &encoded).unwrap();
//! assert_eq!(decoded.as_str(), Some("hello"));
//! ```

mod msgpack;
mod tagged;
mod value;

use bytes::Bytes;

use crate::error::Result;

pub use msgpack::MsgPackCodec;
pub use tagged::{TaggedCodec, MAX_DEPTH};
pub use value::{NumericArray, Value};

/// Converts application values to and from frame bodies.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a value into body bytes.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Deserialize body bytes. Failure marks the frame as corrupt.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}
