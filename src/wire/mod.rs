//! Wire codec (spec §4.1, §6): fixed-width integers, length-prefixed
//! strings/blobs, the self-describing `Value` type, and `Pack` framing.
//!
//! Two TCP agent framings are supported. v1 writes the pack directly on the
//! socket; the caller must know the shape and drain it. v2 wraps every
//! message in a 4-byte big-endian length prefix, so an unknown pack type can
//! be skipped by discarding exactly that many bytes without losing stream
//! alignment.

pub mod magic;
pub mod pack;
pub mod value;

pub use pack::{
    AlertPack, MapPack, ObjectPack, Pack, PerfCounterPack, ProfilePack, SummaryPack, TextPack,
    TimeType, XLogPack,
};
pub use value::Value;

use std::io::{Read, Write};

use crate::error::Result;

/// Read a v2-framed message: a 4-byte length prefix followed by exactly
/// that many bytes, which are then parsed as a `Pack`. Returns `Ok(None)`
/// if the pack type is unrecognized — the length prefix already let us
/// consume the right number of bytes, so the stream stays aligned and the
/// caller can keep reading the next frame.
pub fn read_pack_v2<R: Read>(r: &mut R) -> Result<Option<Pack>> {
    let len = value::read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| crate::error::ServerError::ShortRead {
            expected: len,
            got: 0,
        })?;
    match Pack::decode(&mut &buf[..]) {
        Ok(pack) => Ok(Some(pack)),
        Err(crate::error::ServerError::WireFormat(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn write_pack_v2<W: Write>(w: &mut W, pack: &Pack) -> Result<()> {
    let mut body = Vec::new();
    pack.encode(&mut body)?;
    value::write_u32(w, body.len() as u32)?;
    Ok(w.write_all(&body)?)
}

/// v1 framing: the pack is written directly with no length prefix. The
/// caller must be prepared to drain it even if the type is unrecognized.
pub fn write_pack_v1<W: Write>(w: &mut W, pack: &Pack) -> Result<()> {
    pack.encode(w)
}

pub fn read_pack_v1<R: Read>(r: &mut R) -> Result<Pack> {
    Pack::decode(r)
}

/// Async counterparts used by the agent reverse-RPC channel (spec §4.8),
/// which talks to a `tokio::net::TcpStream` rather than an in-memory
/// buffer. `Pack` is self-delimiting (every field's length is embedded in
/// the stream), so v1 framing is read by growing a buffer and retrying the
/// synchronous decode until it stops short, rather than duplicating the
/// decode logic as async.
pub mod r#async {
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use super::{Pack, Value};
    use crate::error::{Result, ServerError};

    // Read one byte at a time rather than a larger chunk: `buf` is scoped to
    // a single call, so over-reading would silently swallow bytes belonging
    // to whatever frame follows on the stream (a flag byte, the next pack).
    const GROW_CHUNK: usize = 1;

    pub async fn read_pack_v1_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Pack> {
        let mut buf = Vec::new();
        loop {
            match Pack::decode(&mut &buf[..]) {
                Ok(pack) => return Ok(pack),
                Err(ServerError::ShortRead { .. }) => {
                    let mut chunk = [0u8; GROW_CHUNK];
                    let n = r.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(ServerError::ShortRead {
                            expected: buf.len() + 1,
                            got: buf.len(),
                        });
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_pack_v1_async<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, pack: &Pack) -> Result<()> {
        let mut buf = Vec::new();
        pack.encode(&mut buf)?;
        w.write_all(&buf).await?;
        Ok(())
    }

    pub async fn read_pack_v2_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Option<Pack>> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await?;
        match Pack::decode(&mut &body[..]) {
            Ok(pack) => Ok(Some(pack)),
            Err(ServerError::WireFormat(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_pack_v2_async<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, pack: &Pack) -> Result<()> {
        let mut body = Vec::new();
        pack.encode(&mut body)?;
        w.write_all(&(body.len() as u32).to_be_bytes()).await?;
        w.write_all(&body).await?;
        Ok(())
    }

    pub async fn read_text_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<String> {
        let mut len_byte = [0u8; 1];
        r.read_exact(&mut len_byte).await?;
        let len = if len_byte[0] == 0xFF {
            let mut len_buf = [0u8; 4];
            r.read_exact(&mut len_buf).await?;
            u32::from_be_bytes(len_buf) as usize
        } else {
            len_byte[0] as usize
        };
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|e| ServerError::WireFormat(format!("invalid utf8 text: {e}")))
    }

    pub async fn write_text_async<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, text: &str) -> Result<()> {
        let bytes = text.as_bytes();
        if bytes.len() <= 254 {
            w.write_all(&[bytes.len() as u8]).await?;
        } else {
            w.write_all(&[0xFFu8]).await?;
            w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        }
        w.write_all(bytes).await?;
        Ok(())
    }

    pub async fn read_i64_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).await?;
        Ok(i64::from_be_bytes(buf))
    }

    pub async fn read_u32_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn read_value_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Value> {
        let mut buf = Vec::new();
        loop {
            match Value::decode(&mut &buf[..]) {
                Ok(value) => return Ok(value),
                Err(ServerError::ShortRead { .. }) => {
                    let mut chunk = [0u8; GROW_CHUNK];
                    let n = r.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(ServerError::ShortRead {
                            expected: buf.len() + 1,
                            got: buf.len(),
                        });
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
