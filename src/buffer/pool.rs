use parking_lot::Mutex;
use tracing::trace;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// A free buffer may be up to this many bytes larger than requested.
pub const DEFAULT_SLACK: usize = 512;

/// Aggregate capacity of free buffers kept by a pool.
pub const DEFAULT_CEILING: usize = 8 * 1024 * 1024;

static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();

/// A fixed-capacity heap block handed out by a [`BufferPool`].
///
/// The block is owned exclusively by whoever holds the value, so it can
/// never be handed out twice. Its address is stable for its whole life,
/// which lets it be passed to overlapped OS calls.
pub struct PooledBuffer {
    data: Box<[u8]>,
}

impl PooledBuffer {
    fn allocate(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Capacity of the block in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Mutable raw pointer to the first byte.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Native address of the block.
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total capacity of free buffers held by the pool.
    pub pooled_bytes: usize,
    /// Number of free buffers held by the pool.
    pub free_buffers: usize,
    /// Buffers taken and not yet given back.
    pub outstanding: usize,
}

struct Buckets {
    /// `capacity → free buffers of exactly that capacity`.
    free: BTreeMap<usize, VecDeque<PooledBuffer>>,
    pooled_bytes: usize,
    free_buffers: usize,
}

/// Size-bucketed cache of reusable buffers.
///
/// [`take`](Self::take) prefers the smallest free buffer whose capacity
/// lies in `[size, size + slack]`; [`give`](Self::give) files the buffer
/// under its exact capacity. Once the free buffers exceed the ceiling,
/// buffers are released starting from the largest bucket.
///
/// All operations go through a single lock. The pool is only touched
/// once per buffer, never per byte.
pub struct BufferPool {
    buckets: Mutex<Buckets>,
    outstanding: AtomicUsize,
    slack: usize,
    ceiling: usize,
}

impl BufferPool {
    /// Creates a pool with the default slack and ceiling.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_SLACK, DEFAULT_CEILING)
    }

    /// Creates a pool with an explicit slack window and byte ceiling.
    pub fn with_limits(slack: usize, ceiling: usize) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                free: BTreeMap::new(),
                pooled_bytes: 0,
                free_buffers: 0,
            }),
            outstanding: AtomicUsize::new(0),
            slack,
            ceiling,
        }
    }

    /// Returns the process-wide pool, creating it on first use.
    pub fn global() -> Arc<BufferPool> {
        GLOBAL.get_or_init(|| Arc::new(BufferPool::new())).clone()
    }

    /// Takes a buffer of at least `size` bytes.
    pub fn take(&self, size: usize) -> PooledBuffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let mut buckets = self.buckets.lock();
        let upper = size.saturating_add(self.slack);

        let hit = buckets
            .free
            .range_mut(size..=upper)
            .find_map(|(_, queue)| queue.pop_front());

        if let Some(buffer) = hit {
            let capacity = buffer.capacity();
            buckets.pooled_bytes -= capacity;
            buckets.free_buffers -= 1;
            if buckets.free.get(&capacity).is_some_and(VecDeque::is_empty) {
                buckets.free.remove(&capacity);
            }

            trace!(size, capacity, "reused pooled buffer");
            return buffer;
        }

        self.evict(&mut buckets);
        drop(buckets);

        trace!(size, "allocated new buffer");
        PooledBuffer::allocate(size)
    }

    /// Returns a buffer to the pool.
    pub fn give(&self, buffer: PooledBuffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let capacity = buffer.capacity();
        if capacity > self.ceiling {
            return;
        }

        let mut buckets = self.buckets.lock();
        buckets.free.entry(capacity).or_default().push_back(buffer);
        buckets.pooled_bytes += capacity;
        buckets.free_buffers += 1;

        self.evict(&mut buckets);
    }

    /// Releases every free buffer.
    ///
    /// Outstanding buffers are unaffected and may still be given back.
    pub fn clear(&self) {
        let mut buckets = self.buckets.lock();
        buckets.free.clear();
        buckets.pooled_bytes = 0;
        buckets.free_buffers = 0;
    }

    /// Returns a snapshot of the pool's bookkeeping.
    pub fn stats(&self) -> PoolStats {
        let buckets = self.buckets.lock();
        PoolStats {
            pooled_bytes: buckets.pooled_bytes,
            free_buffers: buckets.free_buffers,
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }

    /// Drops free buffers, largest first, until under the ceiling.
    fn evict(&self, buckets: &mut Buckets) {
        while buckets.pooled_bytes > self.ceiling {
            let Some(mut entry) = buckets.free.last_entry() else {
                break;
            };

            let capacity = *entry.key();
            if entry.get_mut().pop_back().is_some() {
                buckets.pooled_bytes -= capacity;
                buckets.free_buffers -= 1;
                trace!(capacity, "evicted pooled buffer");
            }

            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("slack", &self.slack)
            .field("ceiling", &self.ceiling)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_at_least_requested_capacity() {
        let pool = BufferPool::new();
        let buffer = pool.take(100);
        assert!(buffer.capacity() >= 100);
        assert_eq!(buffer.as_ptr() as usize, buffer.address());
    }

    #[test]
    fn reuses_buffer_within_slack() {
        let pool = BufferPool::new();
        let buffer = pool.take(1000);
        let address = buffer.address();
        pool.give(buffer);

        let again = pool.take(800);
        assert_eq!(again.address(), address);
        assert_eq!(again.capacity(), 1000);
        assert_eq!(pool.stats().free_buffers, 0);
    }

    #[test]
    fn does_not_reuse_outside_slack() {
        let pool = BufferPool::new();
        pool.give(pool.take(4096));

        let small = pool.take(16);
        assert_eq!(small.capacity(), 16);
        assert_eq!(pool.stats().free_buffers, 1);
    }

    #[test]
    fn prefers_smallest_fitting_bucket() {
        let pool = BufferPool::new();
        let a = pool.take(600);
        let b = pool.take(520);
        pool.give(a);
        pool.give(b);

        let got = pool.take(500);
        assert_eq!(got.capacity(), 520);
    }

    #[test]
    fn give_take_cycle_is_bounded() {
        let pool = BufferPool::new();
        for _ in 0..10_000 {
            let buffer = pool.take(2048);
            pool.give(buffer);
        }

        let stats = pool.stats();
        assert_eq!(stats.free_buffers, 1);
        assert_eq!(stats.pooled_bytes, 2048);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn evicts_largest_first_over_ceiling() {
        let pool = BufferPool::with_limits(0, 4096);
        let small = pool.take(1024);
        let large = pool.take(4096);
        pool.give(small);
        pool.give(large);

        let stats = pool.stats();
        assert!(stats.pooled_bytes <= 4096);
        assert_eq!(stats.free_buffers, 1);
        assert_eq!(pool.take(1024).capacity(), 1024);
        assert_eq!(pool.stats().free_buffers, 0);
    }

    #[test]
    fn clear_releases_free_buffers() {
        let pool = BufferPool::new();
        pool.give(pool.take(64));
        pool.clear();
        assert_eq!(pool.stats().pooled_bytes, 0);
    }
}
