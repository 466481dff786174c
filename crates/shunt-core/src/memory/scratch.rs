//! Shared pool of scratch byte buffers
//!
//! Used while assembling stub pages before they are copied into executable
//! memory. Buffers go back to the pool on drop and must not be kept past that.

use crossbeam::queue::ArrayQueue;
use once_cell::sync::Lazy;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// Number of idle buffers the pool keeps around
const POOL_CAPACITY: usize = 16;

/// Buffers larger than this are dropped instead of pooled (1MB)
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

static POOL: Lazy<ArrayQueue<Vec<u8>>> = Lazy::new(|| ArrayQueue::new(POOL_CAPACITY));

pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    /// Rent a zero-filled buffer of exactly `len` bytes
    pub fn rent(len: usize) -> Self {
        let mut buf = POOL.pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        Self { buf }
    }
}

impl Deref for ScratchBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ScratchBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            if let Err(rejected) = POOL.push(buf) {
                warn!(
                    "Scratch pool full; dropping {} byte buffer",
                    rejected.capacity()
                );
            }
        }
    }
}
