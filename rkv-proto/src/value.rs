//! # Reply Values
//!
//! Typed RESP2 replies as produced by the decoder.

use bytes::Bytes;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Bytes),
    /// -ERR ... responses nested inside arrays (top-level errors are
    /// reported separately by the decoder).
    Error(Bytes),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Bytes>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// The null bulk string, also used for replies the server never sends.
    pub const fn nil() -> Self {
        RespValue::Bulk(None)
    }

    /// Returns true for null bulk strings and null arrays.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// Raw payload of simple and bulk strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Payload of simple and bulk strings when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|data| std::str::from_utf8(data).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Elements of a non-null array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}
