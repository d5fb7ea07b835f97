//! Reusable message buffers.
//!
//! Commands borrow a [`BufferSegment`] for the lifetime of one request/response
//! exchange. Segments at or under [`BUFFER_CUTOFF`] come from a shared
//! [`BufferPool`] and return to it when the command terminates; larger
//! messages get a one-shot heap segment that is dropped on release. The pool
//! carries a generation counter so that holders of a segment can detect a
//! reconfiguration and re-check out.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex as AsyncMutex;

/// Messages larger than this never enter the pool.
pub const BUFFER_CUTOFF: usize = 128 * 1024;

/// A byte range a command reads and writes through.
#[derive(Debug)]
pub struct BufferSegment {
    bytes: Vec<u8>,
    size: usize,
    generation: u32,
    pooled: bool,
}

impl BufferSegment {
    fn from_pool(bytes: Vec<u8>, generation: u32) -> BufferSegment {
        let size = bytes.len();
        BufferSegment {
            bytes,
            size,
            generation,
            pooled: true,
        }
    }

    /// A standalone heap segment for a message that exceeded the pool cutoff.
    pub fn oversized(size: usize) -> BufferSegment {
        BufferSegment {
            bytes: vec![0; size],
            size,
            generation: 0,
            pooled: false,
        }
    }

    /// Whether this segment belongs to a pool.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Usable size of the segment for the current message.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Narrows or widens the active range within the existing allocation.
    /// The caller must have verified `size <= capacity()`.
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= self.bytes.len());
        self.size = size;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.size]
    }
}

/// Fixed-size arena of reusable message buffers.
///
/// Checkout and return never block command progress: an exhausted pool hands
/// out a fresh allocation that is simply dropped on return if the pool has
/// refilled in the meantime.
#[derive(Debug)]
pub struct BufferPool {
    free: AsyncMutex<Vec<Vec<u8>>>,
    total: usize,
    generation: AtomicU32,
}

impl BufferPool {
    /// Preallocates `count` buffers of [`BUFFER_CUTOFF`] bytes each.
    pub fn new(count: usize) -> BufferPool {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(vec![0u8; BUFFER_CUTOFF]);
        }
        BufferPool {
            free: AsyncMutex::new(free),
            total: count,
            generation: AtomicU32::new(0),
        }
    }

    /// Checks out a segment able to hold `size` bytes.
    ///
    /// Requests over [`BUFFER_CUTOFF`] bypass the pool entirely.
    pub async fn get_next(&self, size: usize) -> BufferSegment {
        if size > BUFFER_CUTOFF {
            return BufferSegment::oversized(size);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let bytes = {
            let mut free = self.free.lock().await;
            free.pop()
        };
        let bytes = bytes.unwrap_or_else(|| vec![0u8; BUFFER_CUTOFF]);
        let mut segment = BufferSegment::from_pool(bytes, generation);
        segment.set_size(size.max(1));
        segment
    }

    /// Returns a segment. Oversized segments and segments from a previous
    /// generation are dropped; the pool never grows past its configured size.
    pub async fn put(&self, segment: BufferSegment) {
        if !segment.pooled {
            return;
        }
        if segment.generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        let mut free = self.free.lock().await;
        if free.len() < self.total {
            free.push(segment.bytes);
        }
    }

    /// Whether the pool has been reconfigured since `segment` was checked out.
    /// Holders should discard the segment and check out again.
    pub fn has_buffer_changed(&self, segment: &BufferSegment) -> bool {
        segment.pooled && segment.generation != self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every outstanding segment and refills the pool with fresh
    /// allocations.
    pub async fn reconfigure(&self, count: usize) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut free = self.free.lock().await;
        free.clear();
        for _ in 0..count.min(self.total) {
            free.push(vec![0u8; BUFFER_CUTOFF]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkout_and_return() {
        let pool = BufferPool::new(2);
        let seg = pool.get_next(1024).await;
        assert!(seg.is_pooled());
        assert_eq!(seg.size(), 1024);
        assert_eq!(seg.capacity(), BUFFER_CUTOFF);
        pool.put(seg).await;
        assert_eq!(pool.free.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_never_cached() {
        let pool = BufferPool::new(1);
        let seg = pool.get_next(BUFFER_CUTOFF + 1).await;
        assert!(!seg.is_pooled());
        assert_eq!(seg.size(), BUFFER_CUTOFF + 1);
        pool.put(seg).await;
        // The pool still holds only its original buffer.
        assert_eq!(pool.free.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_allocates_fresh() {
        let pool = BufferPool::new(1);
        let a = pool.get_next(16).await;
        let b = pool.get_next(16).await;
        assert!(a.is_pooled() && b.is_pooled());
        pool.put(a).await;
        pool.put(b).await;
        // Only one slot; the second return is dropped.
        assert_eq!(pool.free.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_generation_change_detected() {
        let pool = BufferPool::new(1);
        let seg = pool.get_next(16).await;
        assert!(!pool.has_buffer_changed(&seg));
        pool.reconfigure(1).await;
        assert!(pool.has_buffer_changed(&seg));
        // Stale segments are dropped on return.
        pool.put(seg).await;
        assert_eq!(pool.free.lock().await.len(), 1);
    }
}
