//! Reusable part buffers.
//!
//! Many multi-megabyte parts can be in flight at once; recycling their
//! backing vectors keeps the allocator out of the hot path. A buffer goes
//! back to its pool when the last handle to it is dropped, which for an
//! uploaded part is after the HTTP call finished with the body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// Default number of idle buffers a pool keeps.
pub const DEFAULT_MAX_RETAINED: usize = 16;

/// Hands out part buffers.
pub trait BufferAllocator: Send + Sync {
    /// Returns a zero-initialised buffer of exactly `length` bytes.
    fn allocate(&self, length: usize) -> PartBuffer;
}

/// A buffer owned by exactly one worker at a time.
pub struct PartBuffer {
    data: Vec<u8>,
    len: usize,
    home: Option<Arc<PoolShared>>,
}

impl PartBuffer {
    fn new(data: Vec<u8>, home: Option<Arc<PoolShared>>) -> Self {
        let len = data.len();
        Self { data, len, home }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Writable view over the usable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Shrinks the usable length, e.g. after a short read.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Converts into cheaply clonable bytes.
    ///
    /// The backing vector returns to the pool once every clone is dropped.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PartBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl std::fmt::Debug for PartBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.capacity())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for PartBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers created from fresh allocations.
    pub allocated: u64,
    /// Allocations served from an idle buffer.
    pub reused: u64,
    /// Idle buffers currently held.
    pub retained: usize,
}

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl PoolShared {
    fn recycle(&self, data: Vec<u8>) {
        if let Ok(mut free) = self.free.lock()
            && free.len() < self.max_retained
        {
            free.push(data);
        }
    }

    fn take_fitting(&self, length: usize) -> Option<Vec<u8>> {
        let mut free = self.free.lock().ok()?;
        // Smallest idle buffer that fits.
        let idx = free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= length)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i)?;
        Some(free.swap_remove(idx))
    }
}

/// Thread-safe pooling allocator.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED)
    }
}

impl BufferPool {
    /// Creates a pool keeping at most `max_retained` idle buffers.
    pub fn new(max_retained: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                max_retained,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            retained: self.shared.free.lock().map(|f| f.len()).unwrap_or(0),
        }
    }
}

impl BufferAllocator for BufferPool {
    fn allocate(&self, length: usize) -> PartBuffer {
        let data = match self.shared.take_fitting(length) {
            Some(mut data) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                data.clear();
                data.resize(length, 0);
                data
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; length]
            }
        };
        PartBuffer::new(data, Some(Arc::clone(&self.shared)))
    }
}

/// Allocator that never pools; every buffer is freed on drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, length: usize) -> PartBuffer {
        PartBuffer::new(vec![0u8; length], None)
    }
}
