//! Shared buffer pools for the connection hot path.
//!
//! Two pools exist process-wide: 4 KiB slabs for peeking at freshly accepted
//! connections and 32 KiB slabs for splice copy loops. Buffers are handed out
//! as plain `Vec<u8>` and must be returned with [`BufferPool::put`]; the pool
//! tracks acquisitions and releases so tests can verify that every exit path
//! returns its buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Size of the peek buffer used when sniffing a new connection.
pub const PEEK_BUF_SIZE: usize = 4096;

/// Size of the copy buffers used for splicing, same as the proxy engine.
pub const COPY_BUF_SIZE: usize = 32 * 1024;

/// A free-list pool of fixed-size byte buffers.
pub struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    /// Creates an empty pool handing out buffers of `buf_size` bytes.
    pub fn new(buf_size: usize) -> Self {
        Self {
            buf_size,
            free: Mutex::new(Vec::new()),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Takes a buffer from the pool, allocating when the free list is empty.
    ///
    /// The returned buffer always has length `buf_size`.
    pub fn get(&self) -> Vec<u8> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let recycled = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop();
        recycled.unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    /// Returns a buffer to the pool.
    ///
    /// Accepts buffers that were truncated by the caller; they are restored
    /// to full length before reuse.
    pub fn put(&self, mut buf: Vec<u8>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        buf.resize(self.buf_size, 0);
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .push(buf);
    }

    /// Number of buffers handed out over the pool's lifetime.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Number of buffers returned over the pool's lifetime.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> u64 {
        self.acquired() - self.released()
    }
}
