//! Datagram buffer pool
//!
//! The packet pipeline recycles fixed-size buffers between the reader,
//! the per-query tasks and the writer so the hot path allocates only on
//! pool misses. Each buffer has exactly one in-flight owner at a time;
//! ownership transfers with the buffer through the channels.

use parking_lot::Mutex;

/// Buffer capacity, equal to the TUN MTU
pub const BUFFER_SIZE: usize = 1500;

/// Concurrent free list of fixed-size datagram buffers.
///
/// Allocates on miss and never caps the free list. Buffers come out at
/// full length regardless of how much of them the previous owner used.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer from the pool, allocating when the pool is empty.
    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    /// Return a buffer, restoring it to full length for the next owner.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.resize(BUFFER_SIZE, 0);
        self.free.lock().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
