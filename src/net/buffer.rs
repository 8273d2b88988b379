//! Pool of fixed-size buffers backing copied write data.
//!
//! Callers writing borrowed byte slices have their bytes copied into pooled
//! buffers so the data can cross to the listener thread without a fresh
//! allocation per write. A [`PooledBuffer`] returns itself to its pool when
//! dropped, which makes the "returned exactly once" rule hold on success,
//! error and terminate paths alike.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Thread-safe pool of equally sized byte buffers.
pub struct BufferPool {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Creates an empty pool.
    ///
    /// # Arguments
    /// * `buffer_size` - Size of every buffer handed out
    /// * `capacity` - Maximum number of idle buffers kept for reuse
    pub fn new(buffer_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            capacity,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Takes an empty buffer from the pool, allocating one if none is idle.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let data = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));

        self.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            data,
            pool: Arc::clone(self),
        }
    }

    /// Size of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        data.clear();

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(data);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("outstanding", &self.outstanding())
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Copies as much of `bytes` as fits and returns the number copied.
    pub(crate) fn fill(&mut self, bytes: &[u8]) -> usize {
        let count = self.remaining_capacity().min(bytes.len());
        self.data.extend_from_slice(&bytes[..count]);
        count
    }

    pub(crate) fn remaining_capacity(&self) -> usize {
        self.pool.buffer_size.saturating_sub(self.data.len())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
