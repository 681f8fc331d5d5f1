//! # Incremental RESP2 Decoding
//!
//! Purpose: Accept reply bytes in arbitrary slices as they arrive from the
//! socket and hand back complete replies strictly in wire order.
//!
//! ## Design Principles
//! 1. **Push-Based**: `feed` appends bytes, `next_reply` pulls one complete
//!    reply or reports that more input is needed.
//! 2. **No Partial State**: A reply is parsed from the start of the buffer on
//!    each attempt and consumed only once it is complete.
//! 3. **Binary-Safe**: Bulk strings are sliced as raw bytes.
//! 4. **Fail Fast**: Invalid framing is fatal; the caller must tear down the
//!    connection because the stream position is lost.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};
use crate::value::RespValue;

/// Default maximum bulk string length (matches the server's 512 MiB limit).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Nesting limit for arrays; deeper replies are treated as corrupt.
const MAX_DEPTH: usize = 512;

/// One decoded top-level reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A regular reply value.
    Reply(RespValue),
    /// A top-level `-ERR ...` reply, addressed to a single command.
    Error(Bytes),
}

/// Push-based RESP2 reply decoder.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_bulk_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl Decoder {
    /// Creates a decoder with the default bulk length limit.
    pub fn new() -> Self {
        Decoder::with_max_bulk_len(DEFAULT_MAX_BULK_LEN)
    }

    pub fn with_max_bulk_len(max_bulk_len: usize) -> Self {
        Decoder {
            buf: BytesMut::with_capacity(8 * 1024),
            max_bulk_len,
        }
    }

    /// Appends raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops any buffered input; used when a connection is replaced.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Pulls the next complete reply.
    ///
    /// **Output**: `Ok(Some(_))` for a complete reply, `Ok(None)` when more
    /// input is needed.
    ///
    /// # Errors
    /// `ProtoError::Protocol` or `ProtoError::TooLarge` when framing is
    /// corrupt. The buffer is left untouched; the caller is expected to
    /// `reset` and reconnect.
    pub fn next_reply(&mut self) -> ProtoResult<Option<Decoded>> {
        let (value, consumed) = match parse_value(&self.buf, 0, 0, self.max_bulk_len)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        self.buf.advance(consumed);
        Ok(Some(match value {
            RespValue::Error(message) => Decoded::Error(message),
            other => Decoded::Reply(other),
        }))
    }
}

/// Parses one value starting at `pos`. Returns the value and the position
/// just past it, or `None` when the buffer ends early.
fn parse_value(
    buf: &[u8],
    pos: usize,
    depth: usize,
    max_bulk_len: usize,
) -> ProtoResult<Option<(RespValue, usize)>> {
    if depth > MAX_DEPTH {
        return Err(ProtoError::Protocol("reply nesting too deep".to_string()));
    }
    let (line, next) = match read_line(buf, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ProtoError::Protocol("empty reply line".to_string()));
    }

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(Bytes::copy_from_slice(body)), next))),
        b'-' => Ok(Some((RespValue::Error(Bytes::copy_from_slice(body)), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(body)?), next))),
        b'$' => {
            let len = parse_i64(body)?;
            parse_bulk(buf, next, len, max_bulk_len)
        }
        b'*' => {
            let len = parse_i64(body)?;
            parse_array(buf, next, len, depth, max_bulk_len)
        }
        other => Err(ProtoError::Protocol(format!(
            "invalid reply type byte 0x{other:02x}"
        ))),
    }
}

fn parse_bulk(
    buf: &[u8],
    pos: usize,
    len: i64,
    max_bulk_len: usize,
) -> ProtoResult<Option<(RespValue, usize)>> {
    if len == -1 {
        return Ok(Some((RespValue::Bulk(None), pos)));
    }
    if len < 0 {
        return Err(ProtoError::Protocol(format!("invalid bulk length {len}")));
    }
    let len = len as usize;
    if len > max_bulk_len {
        return Err(ProtoError::TooLarge {
            len,
            limit: max_bulk_len,
        });
    }

    let end = pos + len;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(ProtoError::Protocol("bulk string missing CRLF".to_string()));
    }
    let data = Bytes::copy_from_slice(&buf[pos..end]);
    Ok(Some((RespValue::Bulk(Some(data)), end + 2)))
}

fn parse_array(
    buf: &[u8],
    pos: usize,
    len: i64,
    depth: usize,
    max_bulk_len: usize,
) -> ProtoResult<Option<(RespValue, usize)>> {
    if len == -1 {
        return Ok(Some((RespValue::Array(None), pos)));
    }
    if len < 0 {
        return Err(ProtoError::Protocol(format!("invalid array length {len}")));
    }

    // Every element needs at least 3 bytes, so a huge announced length cannot
    // force a huge allocation before the bytes actually arrive.
    let remaining = buf.len().saturating_sub(pos);
    let mut items = Vec::with_capacity((len as usize).min(remaining / 3));
    let mut cursor = pos;
    for _ in 0..len {
        match parse_value(buf, cursor, depth + 1, max_bulk_len)? {
            Some((item, next)) => {
                items.push(item);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(Some(items)), cursor)))
}

/// Finds the CRLF-terminated line at `pos`. Returns the line without CRLF and
/// the position after it.
fn read_line(buf: &[u8], pos: usize) -> ProtoResult<Option<(&[u8], usize)>> {
    let rest = &buf[pos.min(buf.len())..];
    let newline = match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => idx,
        None => return Ok(None),
    };
    if newline == 0 || rest[newline - 1] != b'\r' {
        return Err(ProtoError::Protocol("line not terminated by CRLF".to_string()));
    }
    Ok(Some((&rest[..newline - 1], pos + newline + 1)))
}

fn parse_i64(data: &[u8]) -> ProtoResult<i64> {
    if data.is_empty() {
        return Err(ProtoError::Protocol("empty integer".to_string()));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ProtoError::Protocol("empty integer".to_string()));
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ProtoError::Protocol("invalid integer".to_string()));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}
