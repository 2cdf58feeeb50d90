//! Transfer, eviction and allocation counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters of one device context.
///
/// Updated with relaxed atomics; a snapshot is consistent per field, not
/// across fields.
#[derive(Debug, Default)]
pub struct DeviceStats {
    eviction_rounds: AtomicU64,
    objects_evicted: AtomicU64,
    bytes_evicted: AtomicU64,
    write_backs: AtomicU64,
    host_to_device_transfers: AtomicU64,
    host_to_device_bytes: AtomicU64,
    device_to_host_transfers: AtomicU64,
    device_to_host_bytes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    pool_drains: AtomicU64,
}

/// Point-in-time copy of `DeviceStats` plus pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatsSnapshot {
    /// Capacity requests that had to evict live objects
    pub eviction_rounds: u64,
    /// Live objects evicted
    pub objects_evicted: u64,
    /// Bytes reclaimed from live objects
    pub bytes_evicted: u64,
    /// Dirty buffers copied home before being freed
    pub write_backs: u64,
    /// Host-to-device copies
    pub host_to_device_transfers: u64,
    /// Bytes copied host-to-device
    pub host_to_device_bytes: u64,
    /// Device-to-host copies (write-backs and host reads)
    pub device_to_host_transfers: u64,
    /// Bytes copied device-to-host
    pub device_to_host_bytes: u64,
    /// Fresh allocator calls that succeeded
    pub allocations: u64,
    /// Buffers handed back to the allocator
    pub frees: u64,
    /// Pooled buffers freed to make room
    pub pool_drains: u64,
    /// Allocations served from the pool
    pub pool_hits: u64,
    /// Allocations that missed the pool
    pub pool_misses: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl DeviceStats {
    pub(crate) fn record_eviction_round(&self) {
        bump(&self.eviction_rounds, 1);
    }

    pub(crate) fn record_eviction(&self, bytes: usize) {
        bump(&self.objects_evicted, 1);
        bump(&self.bytes_evicted, bytes as u64);
    }

    pub(crate) fn record_write_back(&self, bytes: usize) {
        bump(&self.write_backs, 1);
        self.record_device_to_host(bytes);
    }

    pub(crate) fn record_host_to_device(&self, bytes: usize) {
        bump(&self.host_to_device_transfers, 1);
        bump(&self.host_to_device_bytes, bytes as u64);
    }

    pub(crate) fn record_device_to_host(&self, bytes: usize) {
        bump(&self.device_to_host_transfers, 1);
        bump(&self.device_to_host_bytes, bytes as u64);
    }

    pub(crate) fn record_allocation(&self) {
        bump(&self.allocations, 1);
    }

    pub(crate) fn record_free(&self) {
        bump(&self.frees, 1);
    }

    pub(crate) fn record_pool_drain(&self) {
        bump(&self.pool_drains, 1);
    }

    /// Copy the counters; pool hit/miss counts come from the pool itself.
    #[must_use]
    pub fn snapshot(&self, pool_hits: u64, pool_misses: u64) -> DeviceStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeviceStatsSnapshot {
            eviction_rounds: load(&self.eviction_rounds),
            objects_evicted: load(&self.objects_evicted),
            bytes_evicted: load(&self.bytes_evicted),
            write_backs: load(&self.write_backs),
            host_to_device_transfers: load(&self.host_to_device_transfers),
            host_to_device_bytes: load(&self.host_to_device_bytes),
            device_to_host_transfers: load(&self.device_to_host_transfers),
            device_to_host_bytes: load(&self.device_to_host_bytes),
            allocations: load(&self.allocations),
            frees: load(&self.frees),
            pool_drains: load(&self.pool_drains),
            pool_hits,
            pool_misses,
        }
    }
}
