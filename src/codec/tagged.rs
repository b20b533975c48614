//! Type-tagged binary codec.
//!
//! Every value starts with a one-byte tag. Variable-length content carries a
//! `u32` Big Endian length or element count.
//!
//! ```text
//! 0x00 null          0x07 string   (len, utf8)
//! 0x01 undefined     0x08 bytes    (len, raw)
//! 0x02 false         0x09 numeric  (kind, count, elements BE)
//! 0x03 true          0x0A array    (count, values)
//! 0x04 int   (i64)   0x0B map      (count, key/value pairs)
//! 0x05 float (f64)   0x0C set      (count, values)
//! 0x06 bigint (i128) 0x0D object   (count, (len, utf8 key, value) pairs)
//! ```
//!
//! A body must decode to exactly one value with no trailing bytes. Unknown
//! tags fail, which is how a corrupt frame is detected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{NumericArray, Value};
use super::Codec;
use crate::error::{PeerwireError, Result};

const TAG_NULL: u8 = 0x00;
const TAG_UNDEFINED: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_BIGINT: u8 = 0x06;
const TAG_STRING: u8 = 0x07;
const TAG_BYTES: u8 = 0x08;
const TAG_NUMERIC: u8 = 0x09;
const TAG_ARRAY: u8 = 0x0A;
const TAG_MAP: u8 = 0x0B;
const TAG_SET: u8 = 0x0C;
const TAG_OBJECT: u8 = 0x0D;

const KIND_I8: u8 = 0;
const KIND_U8: u8 = 1;
const KIND_I16: u8 = 2;
const KIND_U16: u8 = 3;
const KIND_I32: u8 = 4;
const KIND_U32: u8 = 5;
const KIND_F32: u8 = 6;
const KIND_F64: u8 = 7;
const KIND_I64: u8 = 8;
const KIND_U64: u8 = 9;

/// Maximum nesting of arrays, maps, sets and objects.
pub const MAX_DEPTH: usize = 64;

/// The default body codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedCodec;

impl TaggedCodec {
    /// Encode a value.
    pub fn encode(value: &Value) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        write_value(&mut buf, value, 0)?;
        Ok(buf.freeze())
    }

    /// Decode a value, rejecting trailing bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Value> {
        let value = read_value(&mut bytes, 0)?;
        if bytes.has_remaining() {
            return Err(PeerwireError::Codec(format!(
                "{} trailing bytes after value",
                bytes.remaining()
            )));
        }
        Ok(value)
    }
}

impl Codec for TaggedCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        TaggedCodec::encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        TaggedCodec::decode(bytes)
    }
}

fn write_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| PeerwireError::Codec(format!("length {len} does not fit in u32")))?;
    buf.put_u32(len);
    Ok(())
}

fn write_value(buf: &mut BytesMut, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(PeerwireError::Codec("value nested too deeply".to_string()));
    }
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Undefined => buf.put_u8(TAG_UNDEFINED),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*n);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        Value::BigInt(n) => {
            buf.put_u8(TAG_BIGINT);
            buf.put_i128(*n);
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            write_len(buf, s.len())?;
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            write_len(buf, b.len())?;
            buf.put_slice(b);
        }
        Value::NumericArray(array) => {
            buf.put_u8(TAG_NUMERIC);
            write_numeric(buf, array)?;
        }
        Value::Array(items) | Value::Set(items) => {
            buf.put_u8(if matches!(value, Value::Set(_)) {
                TAG_SET
            } else {
                TAG_ARRAY
            });
            write_len(buf, items.len())?;
            for item in items {
                write_value(buf, item, depth + 1)?;
            }
        }
        Value::Map(entries) => {
            buf.put_u8(TAG_MAP);
            write_len(buf, entries.len())?;
            for (key, item) in entries {
                write_value(buf, key, depth + 1)?;
                write_value(buf, item, depth + 1)?;
            }
        }
        Value::Object(fields) => {
            buf.put_u8(TAG_OBJECT);
            write_len(buf, fields.len())?;
            for (key, item) in fields {
                write_len(buf, key.len())?;
                buf.put_slice(key.as_bytes());
                write_value(buf, item, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn write_numeric(buf: &mut BytesMut, array: &NumericArray) -> Result<()> {
    macro_rules! put_all {
        ($kind:expr, $items:expr, $put:ident) => {{
            buf.put_u8($kind);
            write_len(buf, $items.len())?;
            for item in $items {
                buf.$put(*item);
            }
        }};
    }

    match array {
        NumericArray::I8(v) => put_all!(KIND_I8, v, put_i8),
        NumericArray::U8(v) => put_all!(KIND_U8, v, put_u8),
        NumericArray::I16(v) => put_all!(KIND_I16, v, put_i16),
        NumericArray::U16(v) => put_all!(KIND_U16, v, put_u16),
        NumericArray::I32(v) => put_all!(KIND_I32, v, put_i32),
        NumericArray::U32(v) => put_all!(KIND_U32, v, put_u32),
        NumericArray::F32(v) => put_all!(KIND_F32, v, put_f32),
        NumericArray::F64(v) => put_all!(KIND_F64, v, put_f64),
        NumericArray::I64(v) => put_all!(KIND_I64, v, put_i64),
        NumericArray::U64(v) => put_all!(KIND_U64, v, put_u64),
    }
    Ok(())
}

fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(PeerwireError::Codec(format!(
            "unexpected end of body: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_len(buf: &mut &[u8]) -> Result<usize> {
    ensure(buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    let len = read_len(buf)?;
    ensure(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| PeerwireError::Codec(format!("invalid utf-8: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn read_value(buf: &mut &[u8], depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(PeerwireError::Codec("value nested too deeply".to_string()));
    }
    ensure(buf, 1)?;
    let value = match buf.get_u8() {
        TAG_NULL => Value::Null,
        TAG_UNDEFINED => Value::Undefined,
        TAG_FALSE => Value::Bool(false),
        TAG_TRUE => Value::Bool(true),
        TAG_INT => {
            ensure(buf, 8)?;
            Value::Int(buf.get_i64())
        }
        TAG_FLOAT => {
            ensure(buf, 8)?;
            Value::Float(buf.get_f64())
        }
        TAG_BIGINT => {
            ensure(buf, 16)?;
            Value::BigInt(buf.get_i128())
        }
        TAG_STRING => Value::String(read_string(buf)?),
        TAG_BYTES => {
            let len = read_len(buf)?;
            ensure(buf, len)?;
            let bytes = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Value::Bytes(bytes)
        }
        TAG_NUMERIC => Value::NumericArray(read_numeric(buf)?),
        tag @ (TAG_ARRAY | TAG_SET) => {
            let count = read_len(buf)?;
            let mut items = Vec::with_capacity(count.min(buf.remaining()));
            for _ in 0..count {
                items.push(read_value(buf, depth + 1)?);
            }
            if tag == TAG_SET {
                Value::Set(items)
            } else {
                Value::Array(items)
            }
        }
        TAG_MAP => {
            let count = read_len(buf)?;
            let mut entries = Vec::with_capacity(count.min(buf.remaining() / 2));
            for _ in 0..count {
                let key = read_value(buf, depth + 1)?;
                let item = read_value(buf, depth + 1)?;
                entries.push((key, item));
            }
            Value::Map(entries)
        }
        TAG_OBJECT => {
            let count = read_len(buf)?;
            let mut fields = Vec::with_capacity(count.min(buf.remaining() / 5));
            for _ in 0..count {
                let key = read_string(buf)?;
                let item = read_value(buf, depth + 1)?;
                fields.push((key, item));
            }
            Value::Object(fields)
        }
        other => {
            return Err(PeerwireError::Codec(format!("unknown type tag {other}")));
        }
    };
    Ok(value)
}

fn read_numeric(buf: &mut &[u8]) -> Result<NumericArray> {
    ensure(buf, 1)?;
    let kind = buf.get_u8();
    let count = read_len(buf)?;

    macro_rules! get_all {
        ($variant:ident, $width:expr, $get:ident) => {{
            let needed = count.checked_mul($width).ok_or_else(|| {
                PeerwireError::Codec(format!("numeric array of {count} elements is too large"))
            })?;
            ensure(buf, needed)?;
            NumericArray::$variant((0..count).map(|_| buf.$get()).collect())
        }};
    }

    let array = match kind {
        KIND_I8 => get_all!(I8, 1, get_i8),
        KIND_U8 => get_all!(U8, 1, get_u8),
        KIND_I16 => get_all!(I16, 2, get_i16),
        KIND_U16 => get_all!(U16, 2, get_u16),
        KIND_I32 => get_all!(I32, 4, get_i32),
        KIND_U32 => get_all!(U32, 4, get_u32),
        KIND_F32 => get_all!(F32, 4, get_f32),
        KIND_F64 => get_all!(F64, 8, get_f64),
        KIND_I64 => get_all!(I64, 8, get_i64),
        KIND_U64 => get_all!(U64, 8, get_u64),
        other => {
            return Err(PeerwireError::Codec(format!(
                "unknown numeric array kind {other}"
            )));
        }
    };
    Ok(array)
}
