//! Bit-exact encoder/decoder for the self-describing `Value` type and the
//! length-prefixed string/blob primitives it's built from.
//!
//! All integers are big-endian. Short strings/blobs (<= 254 bytes) use a
//! one-byte length prefix; anything longer uses a `0xFF` sentinel followed
//! by a 4-byte length. This file has no knowledge of `Pack` framing — it's
//! the layer `pack.rs` builds on.

use std::io::{Read, Write};

use crate::error::{Result, ServerError};

const LONG_FORM_SENTINEL: u8 = 0xFF;
const SHORT_FORM_MAX: usize = 254;

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_DECIMAL: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BLOB: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;
const TAG_IP: u8 = 8;
const TAG_LONG: u8 = 9;

/// A self-describing primitive used in `MapPack` bodies and nested pack
/// fields. See spec §3/§6 for the wire shape of each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Decimal(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    List(Vec<Value>),
    /// Preserves insertion order so re-encoding a decoded map is byte-exact.
    Map(Vec<(String, Value)>),
    Ip([u8; 4]),
    Long(i64),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::Decimal(_) => TAG_DECIMAL,
            Value::Float(_) => TAG_FLOAT,
            Value::Text(_) => TAG_TEXT,
            Value::Blob(_) => TAG_BLOB,
            Value::List(_) => TAG_LIST,
            Value::Map(_) => TAG_MAP,
            Value::Ip(_) => TAG_IP,
            Value::Long(_) => TAG_LONG,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<i64> {
        match self {
            Value::Decimal(v) | Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[self.tag()])?;
        self.encode_body(w)
    }

    fn encode_body<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => Ok(w.write_all(&[if *b { 1 } else { 0 }])?),
            Value::Decimal(v) | Value::Long(v) => Ok(w.write_all(&v.to_be_bytes())?),
            Value::Float(f) => Ok(w.write_all(&f.to_be_bytes())?),
            Value::Text(s) => write_str(w, s.as_bytes()),
            Value::Blob(b) => write_str(w, b),
            Value::List(items) => {
                let elem_tag = items.first().map(|v| v.tag()).unwrap_or(TAG_NULL);
                w.write_all(&[elem_tag])?;
                write_u32(w, items.len() as u32)?;
                for item in items {
                    item.encode_body(w)?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                write_u32(w, entries.len() as u32)?;
                for (key, value) in entries {
                    write_str(w, key.as_bytes())?;
                    value.encode(w)?;
                }
                Ok(())
            }
            Value::Ip(octets) => Ok(w.write_all(octets)?),
        }
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Value> {
        let tag = read_u8(r)?;
        Self::decode_body(r, tag)
    }

    fn decode_body<R: Read>(r: &mut R, tag: u8) -> Result<Value> {
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOLEAN => Ok(Value::Boolean(read_u8(r)? != 0)),
            TAG_DECIMAL => Ok(Value::Decimal(read_i64(r)?)),
            TAG_FLOAT => Ok(Value::Float(f64::from_be_bytes(read_exact::<8, _>(r)?))),
            TAG_TEXT => Ok(Value::Text(
                String::from_utf8(read_str(r)?)
                    .map_err(|e| ServerError::WireFormat(format!("invalid utf8 text: {e}")))?,
            )),
            TAG_BLOB => Ok(Value::Blob(read_str(r)?)),
            TAG_LIST => {
                let elem_tag = read_u8(r)?;
                let count = read_u32(r)?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(Value::decode_body(r, elem_tag)?);
                }
                Ok(Value::List(items))
            }
            TAG_MAP => {
                let count = read_u32(r)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = String::from_utf8(read_str(r)?)
                        .map_err(|e| ServerError::WireFormat(format!("invalid utf8 key: {e}")))?;
                    let value = Value::decode(r)?;
                    entries.push((key, value));
                }
                Ok(Value::Map(entries))
            }
            TAG_IP => Ok(Value::Ip(read_exact::<4, _>(r)?)),
            TAG_LONG => Ok(Value::Long(read_i64(r)?)),
            other => Err(ServerError::WireFormat(format!(
                "unknown value type tag {other}"
            ))),
        }
    }
}

pub(crate) fn write_str<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() <= SHORT_FORM_MAX {
        w.write_all(&[bytes.len() as u8])?;
    } else {
        w.write_all(&[LONG_FORM_SENTINEL])?;
        write_u32(w, bytes.len() as u32)?;
    }
    Ok(w.write_all(bytes)?)
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = match read_u8(r)? {
        LONG_FORM_SENTINEL => read_u32(r)? as usize,
        short => short as usize,
    };
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| ServerError::ShortRead {
            expected: len,
            got: 0,
        })?;
    Ok(buf)
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    Ok(w.write_all(&v.to_be_bytes())?)
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(read_exact::<4, _>(r)?))
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub(crate) fn read_i16<R: Read>(r: &mut R) -> Result<i16> {
    Ok(i16::from_be_bytes(read_exact::<2, _>(r)?))
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    Ok(u16::from_be_bytes(read_exact::<2, _>(r)?))
}

pub(crate) fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    Ok(i32::from_be_bytes(read_exact::<4, _>(r)?))
}

pub(crate) fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    Ok(i64::from_be_bytes(read_exact::<8, _>(r)?))
}

fn read_exact<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|_| ServerError::ShortRead {
        expected: N,
        got: 0,
    })?;
    Ok(buf)
}
