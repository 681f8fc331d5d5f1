//! # RESP2 Request Encoding
//!
//! Purpose: Turn a command name and its arguments into the array-of-bulk-strings
//! framing, choosing between one contiguous frame and segmented writes.
//!
//! ## Design Principles
//! 1. **Two Framing Paths**: Short text builds one contiguous buffer; byte
//!    payloads or large text switch to a header frame plus one frame per
//!    argument so payloads are never concatenated.
//! 2. **Exact Lengths**: `$<len>` is always the byte length after text-to-bytes
//!    conversion.
//! 3. **Pure Function**: Encoding has no side effects; the caller learns which
//!    path was taken from the returned `Encoded` variant.
//!
//! ## Frame Layout
//!
//! ```text
//! *<argc>\r\n $<len>\r\n<name>\r\n $<len>\r\n<arg0>\r\n ...
//! |------------- header ---------| |------- frame -------|
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::CommandArg;
use crate::error::{ProtoError, ProtoResult};

/// Text arguments longer than this many bytes force segmented framing.
pub const SEGMENTED_TEXT_THRESHOLD: usize = 30_000;

const CRLF: &[u8] = b"\r\n";

/// One argument in segmented framing: `$<len>\r\n` prefix, payload, CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgFrame {
    /// `$<len>\r\n`.
    pub prefix: Bytes,
    /// Argument bytes, shared with the caller's buffer when possible.
    pub payload: Bytes,
}

impl ArgFrame {
    fn new(payload: Bytes) -> Self {
        let mut prefix = BytesMut::with_capacity(16);
        put_bulk_len(&mut prefix, payload.len());
        ArgFrame {
            prefix: prefix.freeze(),
            payload,
        }
    }

    /// Wire length of the frame including the trailing CRLF.
    pub fn len(&self) -> usize {
        self.prefix.len() + self.payload.len() + CRLF.len()
    }

    /// Parts in wire order.
    pub fn chunks(&self) -> [Bytes; 3] {
        [
            self.prefix.clone(),
            self.payload.clone(),
            Bytes::from_static(CRLF),
        ]
    }
}

/// Encoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// The whole command in one contiguous frame.
    Inline(Bytes),
    /// Header frame (array length and command name) followed by one frame per
    /// argument.
    Segmented { header: Bytes, frames: Vec<ArgFrame> },
}

impl Encoded {
    pub fn is_segmented(&self) -> bool {
        matches!(self, Encoded::Segmented { .. })
    }

    /// Total number of bytes put on the wire.
    pub fn len(&self) -> usize {
        match self {
            Encoded::Inline(data) => data.len(),
            Encoded::Segmented { header, frames } => {
                header.len() + frames.iter().map(ArgFrame::len).sum::<usize>()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write chunks in wire order. Inline commands yield a single chunk.
    pub fn chunks(&self) -> Vec<Bytes> {
        match self {
            Encoded::Inline(data) => vec![data.clone()],
            Encoded::Segmented { header, frames } => {
                let mut chunks = Vec::with_capacity(1 + frames.len() * 3);
                chunks.push(header.clone());
                for frame in frames {
                    chunks.extend(frame.chunks());
                }
                chunks
            }
        }
    }

    /// Flattens the command into one buffer. Copies segmented payloads.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Encoded::Inline(data) => data.clone(),
            Encoded::Segmented { .. } => {
                let mut out = BytesMut::with_capacity(self.len());
                for chunk in self.chunks() {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }
}

/// Argument after validation, before framing.
enum Prepared {
    Short(Bytes),
    Large(Bytes),
}

/// Encodes `name` and `args` into RESP2 request framing.
///
/// **Input**: command name (sent verbatim) and arguments.
/// **Output**: `Encoded::Inline` when every argument is short text,
/// `Encoded::Segmented` when any argument is a byte buffer or text above
/// `SEGMENTED_TEXT_THRESHOLD` bytes.
///
/// # Errors
/// `ProtoError::InvalidArgumentType` for an empty command name or a timestamp
/// before the Unix epoch.
pub fn encode(name: &str, args: &[CommandArg]) -> ProtoResult<Encoded> {
    if name.is_empty() {
        return Err(ProtoError::InvalidArgumentType {
            command: String::new(),
            index: 0,
            reason: "empty command name".to_string(),
        });
    }

    let mut prepared = Vec::with_capacity(args.len());
    let mut segmented = false;
    for (index, arg) in args.iter().enumerate() {
        let item = match arg {
            CommandArg::Text(text) if text.len() > SEGMENTED_TEXT_THRESHOLD => {
                Prepared::Large(Bytes::copy_from_slice(text.as_bytes()))
            }
            CommandArg::Text(text) => Prepared::Short(Bytes::copy_from_slice(text.as_bytes())),
            CommandArg::Bytes(data) => Prepared::Large(data.clone()),
            CommandArg::Timestamp(ts) => Prepared::Short(timestamp_text(name, index, *ts)?),
        };
        segmented |= matches!(item, Prepared::Large(_));
        prepared.push(item);
    }

    let mut header = BytesMut::with_capacity(16 + name.len());
    header.put_u8(b'*');
    put_usize(&mut header, args.len() + 1);
    header.put_slice(CRLF);
    put_bulk(&mut header, name.as_bytes());

    if !segmented {
        let body: usize = prepared
            .iter()
            .map(|item| match item {
                Prepared::Short(data) | Prepared::Large(data) => data.len() + 16,
            })
            .sum();
        header.reserve(body);
        for item in &prepared {
            if let Prepared::Short(data) = item {
                put_bulk(&mut header, data);
            }
        }
        return Ok(Encoded::Inline(header.freeze()));
    }

    let frames = prepared
        .into_iter()
        .map(|item| match item {
            Prepared::Short(data) | Prepared::Large(data) => ArgFrame::new(data),
        })
        .collect();
    Ok(Encoded::Segmented {
        header: header.freeze(),
        frames,
    })
}

fn timestamp_text(name: &str, index: usize, ts: SystemTime) -> ProtoResult<Bytes> {
    let since_epoch = ts
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ProtoError::InvalidArgumentType {
            command: name.to_ascii_uppercase(),
            index,
            reason: "timestamp precedes the unix epoch".to_string(),
        })?;
    Ok(Bytes::from(since_epoch.as_millis().to_string()))
}

fn put_bulk(out: &mut BytesMut, data: &[u8]) {
    put_bulk_len(out, data.len());
    out.put_slice(data);
    out.put_slice(CRLF);
}

fn put_bulk_len(out: &mut BytesMut, len: usize) {
    out.put_u8(b'$');
    put_usize(out, len);
    out.put_slice(CRLF);
}

fn put_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
