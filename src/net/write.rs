//! Outbound data: write buffers, write actions and the per-connection queue.
//!
//! Each `write_data` call becomes one [`WriteAction`]. Borrowed slices are
//! coalesced into pooled buffers; [`Bytes`] are referenced as they are. The
//! owning listener drains a connection's [`WriteQueue`] with vectored writes,
//! resuming a partially written action from its cursor.
//!
//! # Example
//!
//! ```ignore
//! let pool = BufferPool::new(8192, 64);
//! let mut queue = WriteQueue::new();
//! queue.push(WriteAction::new(&pool, &[
//!     WriteBuffer::copy(b"HTTP/1.1 200 OK\r\n\r\n"),
//!     WriteBuffer::shared(body),
//! ]));
//! let drained = queue.process(&mut stream)?;
//! ```

use crate::net::buffer::{BufferPool, PooledBuffer};

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};
use std::sync::Arc;

/// Upper bound on the slices handed to one vectored write.
const MAX_IO_SLICES: usize = 64;

/// One outbound byte range passed to `write_data`.
#[derive(Debug, Clone)]
pub enum WriteBuffer<'a> {
    /// Borrowed bytes, copied into pooled buffers.
    Copy(&'a [u8]),
    /// A pre-built buffer, referenced without copying.
    ///
    /// The bytes are shared with the caller until written.
    Shared(Bytes),
}

impl<'a> WriteBuffer<'a> {
    /// Bytes to copy into pooled buffers.
    pub fn copy(bytes: &'a [u8]) -> Self {
        Self::Copy(bytes)
    }

    /// Bytes to write without copying.
    pub fn shared(bytes: impl Into<Bytes>) -> Self {
        Self::Shared(bytes.into())
    }

    fn len(&self) -> usize {
        match self {
            Self::Copy(bytes) => bytes.len(),
            Self::Shared(bytes) => bytes.len(),
        }
    }
}

impl<'a> From<&'a [u8]> for WriteBuffer<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Copy(bytes)
    }
}

impl From<Bytes> for WriteBuffer<'_> {
    fn from(bytes: Bytes) -> Self {
        Self::Shared(bytes)
    }
}

#[derive(Debug)]
enum Segment {
    Pooled(PooledBuffer),
    Shared(Bytes),
}

impl Segment {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(buffer) => buffer.as_slice(),
            Self::Shared(bytes) => bytes,
        }
    }
}

/// Position of the first unwritten byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    segment: usize,
    offset: usize,
}

/// The buffers of one `write_data` call.
///
/// Immutable once built, apart from the cursor that records how far a
/// partial write got.
#[derive(Debug)]
pub struct WriteAction {
    segments: Vec<Segment>,
    cursor: Cursor,
    remaining: usize,
}

impl WriteAction {
    /// Materialises `buffers` into segments, preserving call order.
    ///
    /// Consecutive copied slices share pooled buffers until each is full.
    /// Empty buffers are skipped.
    ///
    /// # Arguments
    /// * `pool` - Pool supplying buffers for copied slices
    /// * `buffers` - The caller's buffers, in write order
    pub fn new(pool: &Arc<BufferPool>, buffers: &[WriteBuffer<'_>]) -> Self {
        let mut segments = Vec::new();
        let mut current: Option<PooledBuffer> = None;
        let remaining = buffers.iter().map(WriteBuffer::len).sum();

        for buffer in buffers {
            match buffer {
                WriteBuffer::Copy(bytes) => {
                    let mut bytes: &[u8] = bytes;
                    while !bytes.is_empty() {
                        if current
                            .as_ref()
                            .is_none_or(|pooled| pooled.remaining_capacity() == 0)
                        {
                            if let Some(full) = current.take() {
                                segments.push(Segment::Pooled(full));
                            }
                            current = Some(pool.acquire());
                        }
                        if let Some(pooled) = current.as_mut() {
                            let copied = pooled.fill(bytes);
                            bytes = &bytes[copied..];
                        }
                    }
                }
                WriteBuffer::Shared(bytes) if bytes.is_empty() => {}
                WriteBuffer::Shared(bytes) => {
                    if let Some(pooled) = current.take() {
                        segments.push(Segment::Pooled(pooled));
                    }
                    segments.push(Segment::Shared(bytes.clone()));
                }
            }
        }

        if let Some(pooled) = current.take().filter(|pooled| !pooled.is_empty()) {
            segments.push(Segment::Pooled(pooled));
        }

        Self {
            segments,
            cursor: Cursor::default(),
            remaining,
        }
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether every byte has been written.
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }

    /// Writes from the cursor until drained or the writer would block.
    ///
    /// # Returns
    /// `true` once every byte is written, `false` if the writer filled up first
    fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while !self.is_drained() {
            let written = {
                let slices = self.io_slices();
                match writer.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "vectored write accepted zero bytes",
                        ));
                    }
                    Ok(written) => written,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            };

            self.advance(written);
        }

        Ok(true)
    }

    fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(MAX_IO_SLICES.min(self.segments.len()));

        for (index, segment) in self.segments.iter().enumerate().skip(self.cursor.segment) {
            let bytes = segment.as_slice();
            let bytes = if index == self.cursor.segment {
                &bytes[self.cursor.offset..]
            } else {
                bytes
            };

            if !bytes.is_empty() {
                slices.push(IoSlice::new(bytes));
            }
            if slices.len() == MAX_IO_SLICES {
                break;
            }
        }

        slices
    }

    fn advance(&mut self, mut written: usize) {
        self.remaining = self.remaining.saturating_sub(written);

        while written > 0 {
            let Some(segment) = self.segments.get(self.cursor.segment) else {
                break;
            };
            let left = segment.as_slice().len() - self.cursor.offset;

            if written < left {
                self.cursor.offset += written;
                return;
            }

            written -= left;
            self.cursor = Cursor {
                segment: self.cursor.segment + 1,
                offset: 0,
            };
        }
    }
}

/// FIFO of write actions for one connection.
#[derive(Debug, Default)]
pub struct WriteQueue {
    actions: VecDeque<WriteAction>,
}

impl WriteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action behind everything already queued.
    pub fn push(&mut self, action: WriteAction) {
        if !action.is_drained() {
            self.actions.push_back(action);
        }
    }

    /// Whether nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Bytes waiting across all queued actions.
    pub fn pending_bytes(&self) -> usize {
        self.actions.iter().map(WriteAction::remaining).sum()
    }

    /// Drains the queue in order into `writer`.
    ///
    /// A partially written action stays at the head with its cursor advanced.
    /// Fully written actions are removed and their pooled buffers released
    /// immediately. An error leaves the queue as it is; the caller terminates
    /// the connection, which releases what is left.
    ///
    /// # Returns
    /// `true` when the queue is empty, `false` when more writes are required
    pub fn process<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while let Some(head) = self.actions.front_mut() {
            if !head.write_to(writer)? {
                return Ok(false);
            }
            self.actions.pop_front();
        }

        Ok(true)
    }

    /// Drops every queued action, discarding unwritten data.
    pub fn clear(&mut self) {
        self.actions.clear();
    }
}
