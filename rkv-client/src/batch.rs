//! # Pipelining Batcher
//!
//! Purpose: Hold encoded commands between `begin_batch` and `end_batch` and
//! release them as a few large writes, plus the outbound buffer every write
//! goes through.
//!
//! ## Design Principles
//! 1. **Explicit Mode**: `BatchMode` is either `Immediate` or `Batching`; no
//!    write path is swapped at runtime.
//! 2. **Bounded Writes**: Coalesced text frames are cut at `MAX_WRITE_BYTES`.
//! 3. **Segments Stay Separate**: Once a batch holds segmented frames, chunks
//!    are released one by one so payload buffers are never concatenated.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use rkv_proto::Encoded;

/// Ceiling for one coalesced write.
pub const MAX_WRITE_BYTES: usize = 4 * 1024 * 1024;

/// Write behaviour of the connection manager.
#[derive(Debug, Default)]
pub(crate) enum BatchMode {
    /// Every command is queued for writing as soon as it is encoded.
    #[default]
    Immediate,
    /// Commands accumulate until the batch ends.
    Batching(PendingBatch),
}

impl BatchMode {
    pub(crate) fn is_batching(&self) -> bool {
        matches!(self, BatchMode::Batching(_))
    }

    /// Starts a batch. A batch already in progress keeps its contents.
    pub(crate) fn begin(&mut self) {
        if !self.is_batching() {
            *self = BatchMode::Batching(PendingBatch::default());
        }
    }

    /// Ends the batch and returns the writes to perform, in order.
    pub(crate) fn end(&mut self) -> Vec<Bytes> {
        match std::mem::take(self) {
            BatchMode::Immediate => Vec::new(),
            BatchMode::Batching(batch) => batch.into_writes(MAX_WRITE_BYTES),
        }
    }

    /// Commands encoded into the batch and not yet released.
    pub(crate) fn held_commands(&self) -> usize {
        match self {
            BatchMode::Immediate => 0,
            BatchMode::Batching(batch) => batch.commands,
        }
    }

    /// Drops anything pending and returns to immediate mode.
    pub(crate) fn reset(&mut self) -> usize {
        match std::mem::take(self) {
            BatchMode::Immediate => 0,
            BatchMode::Batching(batch) => batch.bytes,
        }
    }
}

/// Encoded commands waiting for the end of a batch.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    chunks: Vec<Bytes>,
    segmented: bool,
    bytes: usize,
    commands: usize,
}

impl PendingBatch {
    pub(crate) fn push(&mut self, encoded: Encoded) {
        self.segmented |= encoded.is_segmented();
        self.bytes += encoded.len();
        self.commands += 1;
        self.chunks.extend(encoded.chunks());
    }

    pub(crate) fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Coalesces contiguous frames into writes of at most `limit` bytes. A
    /// single frame above the limit is written on its own. With segmented
    /// frames present, every chunk is its own write.
    fn into_writes(self, limit: usize) -> Vec<Bytes> {
        if self.segmented {
            return self.chunks;
        }
        let mut writes = Vec::new();
        let mut current = BytesMut::new();
        for chunk in self.chunks {
            if !current.is_empty() && current.len() + chunk.len() > limit {
                writes.push(current.split().freeze());
            }
            if chunk.len() >= limit {
                writes.push(chunk);
                continue;
            }
            current.extend_from_slice(&chunk);
        }
        if !current.is_empty() {
            writes.push(current.freeze());
        }
        writes
    }
}

/// Bytes handed to the transport but not yet accepted by it.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

impl Outbound {
    pub(crate) fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub(crate) fn push_encoded(&mut self, encoded: Encoded) {
        for chunk in encoded.chunks() {
            self.push(chunk);
        }
    }

    pub(crate) fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Marks `written` bytes of the front chunk as sent.
    pub(crate) fn advance(&mut self, written: usize) {
        let Some(front) = self.chunks.front_mut() else {
            return;
        };
        let written = written.min(front.len());
        self.bytes -= written;
        if written == front.len() {
            self.chunks.pop_front();
        } else {
            let _ = front.split_to(written);
        }
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.bytes;
        self.chunks.clear();
        self.bytes = 0;
        dropped
    }
}
