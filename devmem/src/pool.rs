//! Free buffer pool.
//!
//! Caches released device buffers by exact byte size so the next allocation
//! of the same size skips the allocator. Pooled buffers are still allocated
//! from the device's point of view but are reclaimable: eviction drains the
//! pool, oldest bucket first, before it touches any live object.

use std::collections::{HashMap, VecDeque};

use crate::constants::POOL_BUCKET_BUFFERS_COUNT_MAX;
use crate::device::DevicePtr;

#[derive(Debug)]
struct PoolBucket {
    /// Oldest at the front.
    buffers: VecDeque<DevicePtr>,
    /// Tick of the most recent push into this bucket.
    populated_tick: u64,
}

/// Size-keyed cache of unbound device buffers.
///
/// Not internally synchronised; the owning `DeviceContext` mutates it only
/// under its context lock.
#[derive(Debug)]
pub struct FreeBufferPool {
    buckets: HashMap<usize, PoolBucket>,
    pooled_bytes: usize,
    buffers_count: usize,
    bytes_max: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl FreeBufferPool {
    /// Create an empty pool holding at most `bytes_max` bytes.
    #[must_use]
    pub fn new(bytes_max: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            pooled_bytes: 0,
            buffers_count: 0,
            bytes_max,
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Pop a buffer of exactly `size_bytes`, newest first.
    ///
    /// Removing the last buffer of a size removes its bucket.
    pub fn try_acquire(&mut self, size_bytes: usize) -> Option<DevicePtr> {
        let Some(bucket) = self.buckets.get_mut(&size_bytes) else {
            self.misses += 1;
            return None;
        };

        let ptr = bucket.buffers.pop_back();
        if bucket.buffers.is_empty() {
            self.buckets.remove(&size_bytes);
        }

        match ptr {
            Some(ptr) => {
                self.hits += 1;
                self.pooled_bytes -= size_bytes;
                self.buffers_count -= 1;
                Some(ptr)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Park a buffer for reuse.
    ///
    /// A buffer that would push the pool past its byte cap, or into a full
    /// bucket, is not kept: older buffers are drained first and, if that is
    /// not enough, the buffer itself goes straight to `free`. Returns the
    /// bytes handed to `free`.
    pub fn release(
        &mut self,
        ptr: DevicePtr,
        size_bytes: usize,
        mut free: impl FnMut(DevicePtr),
    ) -> usize {
        let bucket_full = self
            .buckets
            .get(&size_bytes)
            .is_some_and(|b| b.buffers.len() >= POOL_BUCKET_BUFFERS_COUNT_MAX);
        if size_bytes > self.bytes_max || bucket_full {
            free(ptr);
            return size_bytes;
        }

        let mut freed_bytes = 0;
        while self.pooled_bytes + size_bytes > self.bytes_max {
            match self.drain_oldest(&mut free) {
                Some(bytes) => freed_bytes += bytes,
                None => break,
            }
        }

        self.tick += 1;
        let bucket = self.buckets.entry(size_bytes).or_insert_with(|| PoolBucket {
            buffers: VecDeque::new(),
            populated_tick: 0,
        });
        bucket.buffers.push_back(ptr);
        bucket.populated_tick = self.tick;
        self.pooled_bytes += size_bytes;
        self.buffers_count += 1;

        // Postcondition
        assert!(
            self.pooled_bytes <= self.bytes_max,
            "pool exceeds its byte cap"
        );

        freed_bytes
    }

    /// Free exactly one buffer: the oldest one in the least recently
    /// populated bucket. Returns its size, or `None` if the pool is empty.
    pub fn drain_oldest(&mut self, mut free: impl FnMut(DevicePtr)) -> Option<usize> {
        let size_bytes = self
            .buckets
            .iter()
            .min_by_key(|(_, bucket)| bucket.populated_tick)
            .map(|(size, _)| *size)?;

        let bucket = self.buckets.get_mut(&size_bytes)?;
        let ptr = bucket.buffers.pop_front()?;
        if bucket.buffers.is_empty() {
            self.buckets.remove(&size_bytes);
        }

        self.pooled_bytes -= size_bytes;
        self.buffers_count -= 1;
        free(ptr);

        tracing::debug!(size_bytes, %ptr, "drained pooled buffer");
        Some(size_bytes)
    }

    /// Free every pooled buffer. Returns the bytes freed.
    pub fn drain_all(&mut self, mut free: impl FnMut(DevicePtr)) -> usize {
        let freed_bytes = self.pooled_bytes;
        for (_, bucket) in self.buckets.drain() {
            for ptr in bucket.buffers {
                free(ptr);
            }
        }
        self.pooled_bytes = 0;
        self.buffers_count = 0;
        freed_bytes
    }

    /// Bytes currently parked.
    #[must_use]
    pub fn pooled_bytes(&self) -> usize {
        self.pooled_bytes
    }

    /// Buffers currently parked.
    #[must_use]
    pub fn buffers_count(&self) -> usize {
        self.buffers_count
    }

    /// Number of distinct sizes with at least one buffer.
    #[must_use]
    pub fn buckets_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers_count == 0
    }

    /// Whether a buffer of exactly `size_bytes` is parked.
    #[must_use]
    pub fn contains_size(&self, size_bytes: usize) -> bool {
        self.buckets.contains_key(&size_bytes)
    }

    /// Byte cap.
    #[must_use]
    pub fn bytes_max(&self) -> usize {
        self.bytes_max
    }

    /// Acquisitions served from the pool.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Acquisitions that found no buffer of the requested size.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::POOL_BYTES_MAX_DEFAULT;

    fn pool() -> FreeBufferPool {
        FreeBufferPool::new(POOL_BYTES_MAX_DEFAULT)
    }

    #[test]
    fn test_pool_miss_then_hit() {
        let mut pool = pool();
        assert!(pool.try_acquire(1024).is_none());
        assert_eq!(pool.misses(), 1);

        pool.release(DevicePtr(1), 1024, |_| panic!("nothing should be freed"));
        assert_eq!(pool.pooled_bytes(), 1024);

        assert_eq!(pool.try_acquire(1024), Some(DevicePtr(1)));
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.pooled_bytes(), 0);
        assert_eq!(pool.buckets_count(), 0, "empty bucket must be removed");
    }

    #[test]
    fn test_exact_size_only() {
        let mut pool = pool();
        pool.release(DevicePtr(1), 1024, |_| {});
        assert!(pool.try_acquire(512).is_none());
        assert!(pool.try_acquire(2048).is_none());
        assert!(pool.contains_size(1024));
    }

    #[test]
    fn test_acquire_is_lifo_within_bucket() {
        let mut pool = pool();
        pool.release(DevicePtr(1), 64, |_| {});
        pool.release(DevicePtr(2), 64, |_| {});
        assert_eq!(pool.try_acquire(64), Some(DevicePtr(2)));
        assert_eq!(pool.try_acquire(64), Some(DevicePtr(1)));
    }

    #[test]
    fn test_drain_oldest_picks_least_recently_populated_bucket() {
        let mut pool = pool();
        pool.release(DevicePtr(1), 100, |_| {});
        pool.release(DevicePtr(2), 200, |_| {});
        pool.release(DevicePtr(3), 100, |_| {}); // 100-bucket is now newest

        let mut freed = Vec::new();
        assert_eq!(pool.drain_oldest(|p| freed.push(p)), Some(200));
        assert_eq!(freed, vec![DevicePtr(2)]);

        assert_eq!(pool.drain_oldest(|p| freed.push(p)), Some(100));
        assert_eq!(freed, vec![DevicePtr(2), DevicePtr(1)]);
        assert_eq!(pool.pooled_bytes(), 100);
    }

    #[test]
    fn test_drain_oldest_frees_exactly_once() {
        let mut pool = pool();
        pool.release(DevicePtr(1), 10, |_| {});
        pool.release(DevicePtr(2), 10, |_| {});

        let mut calls = 0;
        pool.drain_oldest(|_| calls += 1);
        assert_eq!(calls, 1);
        assert_eq!(pool.buffers_count(), 1);
    }

    #[test]
    fn test_drain_oldest_empty() {
        let mut pool = pool();
        assert_eq!(pool.drain_oldest(|_| panic!("empty pool freed")), None);
    }

    #[test]
    fn test_zero_sized_buffer_is_drainable() {
        let mut pool = pool();
        pool.release(DevicePtr(9), 0, |_| {});
        assert_eq!(pool.drain_oldest(|_| {}), Some(0));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_byte_cap_drains_oldest() {
        let mut pool = FreeBufferPool::new(250);
        pool.release(DevicePtr(1), 100, |_| {});
        pool.release(DevicePtr(2), 100, |_| {});

        let mut freed = Vec::new();
        let freed_bytes = pool.release(DevicePtr(3), 100, |p| freed.push(p));
        assert_eq!(freed_bytes, 100);
        assert_eq!(freed, vec![DevicePtr(1)]);
        assert_eq!(pool.pooled_bytes(), 200);
    }

    #[test]
    fn test_oversized_buffer_freed_immediately() {
        let mut pool = FreeBufferPool::new(50);
        let mut freed = Vec::new();
        assert_eq!(pool.release(DevicePtr(1), 100, |p| freed.push(p)), 100);
        assert_eq!(freed, vec![DevicePtr(1)]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_disabled_pool_keeps_nothing() {
        let mut pool = FreeBufferPool::new(0);
        let mut freed = 0;
        pool.release(DevicePtr(1), 8, |_| freed += 1);
        assert_eq!(freed, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drain_all() {
        let mut pool = pool();
        pool.release(DevicePtr(1), 10, |_| {});
        pool.release(DevicePtr(2), 20, |_| {});
        pool.release(DevicePtr(3), 20, |_| {});

        let mut freed = Vec::new();
        assert_eq!(pool.drain_all(|p| freed.push(p)), 50);
        freed.sort();
        assert_eq!(freed, vec![DevicePtr(1), DevicePtr(2), DevicePtr(3)]);
        assert!(pool.is_empty());
        assert_eq!(pool.buckets_count(), 0);
    }
}
