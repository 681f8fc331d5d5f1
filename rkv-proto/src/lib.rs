//! # RKV Wire Protocol
//!
//! Purpose: Encode commands into RESP2 request frames and decode server
//! replies incrementally, without touching any I/O.
//!
//! ## Design Principles
//! 1. **Closed Argument Set**: Command arguments are a tagged enum, checked
//!    exhaustively at the encoder boundary.
//! 2. **Zero-Copy Payloads**: Byte arguments travel as `Bytes` and are never
//!    concatenated when the encoder picks segmented framing.
//! 3. **Push-Based Decoding**: Callers feed bytes as they arrive and pull
//!    complete replies in wire order.
//! 4. **Fail Fast**: Framing violations are fatal and surface immediately.

mod command;
mod decode;
mod encode;
mod error;
mod value;

pub use command::{Command, CommandArg};
pub use decode::{Decoded, Decoder, DEFAULT_MAX_BULK_LEN};
pub use encode::{encode, ArgFrame, Encoded, SEGMENTED_TEXT_THRESHOLD};
pub use error::{ProtoError, ProtoResult};
pub use value::RespValue;
