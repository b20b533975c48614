//! MsgPack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so object-like values are written as maps with field
//! names, which is what other MessagePack implementations expect.

use bytes::Bytes;

use super::value::Value;
use super::Codec;
use crate::error::Result;

/// MessagePack body codec.
///
/// An alternative to [`TaggedCodec`](super::TaggedCodec); both ends of a
/// connection must use the same codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode any serializable value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Codec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(MsgPackCodec::encode(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        MsgPackCodec::decode(bytes)
    }
}
