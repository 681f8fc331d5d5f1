//! # Protocol Errors
//!
//! Errors raised while encoding commands or decoding replies. Encoding errors
//! are local to one command; decoding errors mean the byte stream can no
//! longer be trusted.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors surfaced by the encoder and decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// An argument could not be converted into a bulk string.
    #[error("the {command} command contains an invalid argument at index {index}: {reason}")]
    InvalidArgumentType {
        command: String,
        index: usize,
        reason: String,
    },
    /// Reply framing is corrupt; the stream is desynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A bulk string or array announced a length above the configured limit.
    #[error("reply length {len} exceeds limit {limit}")]
    TooLarge { len: usize, limit: usize },
}

impl ProtoError {
    /// Returns true when the error invalidates the whole stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtoError::InvalidArgumentType { .. })
    }
}
