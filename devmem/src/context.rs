//! DeviceContext - Per-Accelerator Memory Manager
//!
//! `TigerStyle`: One critical section per device. Allocation, eviction, pool
//! mutation and registry bookkeeping all run under the context lock and are
//! never interleaved across threads. Lock order is always context, then
//! object slot.
//!
//! # Accounting
//!
//! ```text
//! capacity = used (live objects) + pooled (free pool) + available
//! ```
//!
//! A pool hit moves bytes from `pooled` to `used` and needs no capacity
//! check. A miss first makes room (`ensure_capacity`), then calls the
//! allocator.
//!
//! # Ownership
//!
//! Every `DeviceObject` carries the id of the context that attached it, and
//! every entry point rejects handles from another context. The attach table
//! holds weak references: once the caller drops every handle to a
//! non-resident object its matrix id can be attached again.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use devmem::{DeviceConfig, DeviceContext, HostBlock, HostMatrix};
//!
//! let (ctx, _device) = DeviceContext::sim(DeviceConfig::default().with_capacity_bytes(1024)).unwrap();
//! let matrix = ctx.attach(Arc::new(HostMatrix::new(1, HostBlock::filled(4, 4, 1.0)))).unwrap();
//!
//! assert!(ctx.acquire_read(&matrix).unwrap());   // copied to the device
//! assert!(!ctx.acquire_read(&matrix).unwrap());  // already resident
//! ctx.release_input(&matrix).unwrap();
//! ctx.release_input(&matrix).unwrap();
//! assert_eq!(ctx.used_bytes(), 128);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use devmem_core::Representation;

use crate::config::DeviceConfig;
use crate::constants::CONTEXT_ATTACHED_SWEEP_COUNT_MIN;
use crate::device::{DeviceBackend, DevicePtr, SimDevice, TransferDirection};
use crate::error::{DeviceError, DeviceResult};
use crate::eviction::{evict_object, policy_for, EvictionEngine, EvictionPolicy};
use crate::host::{HostMatrix, MatrixId};
use crate::object::{DeviceObject, ObjectState};
use crate::pool::FreeBufferPool;
use crate::registry::LiveRegistry;
use crate::stats::{DeviceStats, DeviceStatsSnapshot};

/// Source of process-unique context ids.
static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);

/// State guarded by the context lock.
#[derive(Debug)]
struct ContextState {
    pool: FreeBufferPool,
    registry: LiveRegistry,
    attached: BTreeMap<MatrixId, Weak<DeviceObject>>,
    attached_sweep_at: usize,
    used_bytes: usize,
}

impl ContextState {
    fn available_bytes(&self, capacity_bytes: usize) -> usize {
        capacity_bytes.saturating_sub(self.used_bytes + self.pool.pooled_bytes())
    }

    /// Drop attach entries whose objects are gone, amortised over inserts.
    fn sweep_attached(&mut self) {
        if self.attached.len() < self.attached_sweep_at {
            return;
        }
        self.attached.retain(|_, object| object.strong_count() > 0);
        self.attached_sweep_at = (self.attached.len() * 2).max(CONTEXT_ATTACHED_SWEEP_COUNT_MIN);
    }
}

/// What `DeviceContext::shutdown` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Live objects whose buffers were released
    pub objects_released: usize,
    /// Of those, how many were dirty and copied home first
    pub objects_written_back: usize,
    /// Bytes of live buffers freed
    pub live_bytes_freed: usize,
    /// Bytes of pooled buffers freed
    pub pooled_bytes_freed: usize,
}

/// Device memory manager for one accelerator.
#[derive(Debug)]
pub struct DeviceContext {
    id: u64,
    backend: Arc<dyn DeviceBackend>,
    config: DeviceConfig,
    engine: EvictionEngine,
    stats: DeviceStats,
    clock: AtomicU64,
    inner: Mutex<ContextState>,
}

impl DeviceContext {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a context using the configured eviction policy.
    ///
    /// # Errors
    /// Returns `DeviceError::Config` if the configuration does not validate.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: DeviceConfig) -> DeviceResult<Self> {
        let policy = policy_for(config.eviction_policy);
        Self::with_policy(backend, config, policy)
    }

    /// Create a context with a custom eviction policy.
    ///
    /// # Errors
    /// Returns `DeviceError::Config` if the configuration does not validate.
    pub fn with_policy(
        backend: Arc<dyn DeviceBackend>,
        config: DeviceConfig,
        policy: Box<dyn EvictionPolicy>,
    ) -> DeviceResult<Self> {
        config.validate()?;
        let id = CONTEXT_IDS.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            context = id,
            capacity_bytes = config.capacity_bytes,
            policy = policy.name(),
            pool_enabled = config.pool_enabled,
            "device context created"
        );

        Ok(Self {
            id,
            backend,
            inner: Mutex::new(ContextState {
                pool: FreeBufferPool::new(config.effective_pool_bytes_max()),
                registry: LiveRegistry::new(),
                attached: BTreeMap::new(),
                attached_sweep_at: CONTEXT_ATTACHED_SWEEP_COUNT_MIN,
                used_bytes: 0,
            }),
            config,
            engine: EvictionEngine::new(policy),
            stats: DeviceStats::default(),
            clock: AtomicU64::new(0),
        })
    }

    /// Create a context over a fresh `SimDevice` of the configured capacity.
    ///
    /// # Errors
    /// Returns `DeviceError::Config` if the configuration does not validate.
    pub fn sim(config: DeviceConfig) -> DeviceResult<(Self, Arc<SimDevice>)> {
        let device = Arc::new(SimDevice::new(config.capacity_bytes));
        let ctx = Self::new(Arc::clone(&device) as Arc<dyn DeviceBackend>, config)?;
        Ok((ctx, device))
    }

    /// Start mirroring `host` on this device.
    ///
    /// A previous object for the same matrix id that no caller holds any
    /// more is retired first: dirty data is written back and its buffer is
    /// pooled.
    ///
    /// # Errors
    /// - `AlreadyAttached` if a caller still holds a live (not destroyed)
    ///   object for the same matrix id, or an abandoned one is still locked
    /// - `Transfer` if the write-back of an orphaned dirty object fails
    pub fn attach(&self, host: Arc<HostMatrix>) -> DeviceResult<Arc<DeviceObject>> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let id = host.id();

        if let Some(previous) = state.attached.get(&id).and_then(Weak::upgrade) {
            // Strong refs the context itself holds: this upgrade and the
            // registry entry.
            let internal = 1 + usize::from(state.registry.contains(id));
            if Arc::strong_count(&previous) > internal || previous.is_locked() {
                return Err(DeviceError::AlreadyAttached { id });
            }
            self.retire_orphan(state, &previous)?;
        }

        state.sweep_attached();
        let object = Arc::new(DeviceObject::new(host, self.id));
        state.attached.insert(id, Arc::downgrade(&object));
        tracing::debug!(%id, context = self.id, "attached");
        Ok(object)
    }

    // =========================================================================
    // Acquire / Release
    // =========================================================================

    /// Pin `object` for reading, copying it to the device if needed.
    ///
    /// Returns whether a host-to-device transfer happened. Never evicts the
    /// object itself.
    ///
    /// # Errors
    /// - `ForeignObject` if another context attached the object
    /// - `ObjectFreed` after `destroy`
    /// - `HostDataMissing` if the object is not resident and has no host data
    /// - `DeviceOutOfMemory` if no room can be made
    /// - `Transfer` if the copy fails (the fresh buffer is recycled)
    #[tracing::instrument(level = "debug", skip(self, object), fields(id = %object.id()))]
    pub fn acquire_read(&self, object: &Arc<DeviceObject>) -> DeviceResult<bool> {
        self.check_owner(object)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let transferred = match object.state() {
            ObjectState::Freed => return Err(DeviceError::ObjectFreed { id: object.id() }),
            ObjectState::Unallocated => {
                self.upload(state, object)?;
                true
            }
            ObjectState::AllocatedClean | ObjectState::AllocatedDirty => false,
            ObjectState::Evicting => unreachable!("evicting state escaped the context lock"),
        };

        object.lock_increment(self.tick());
        tracing::debug!(transferred, lock_count = object.lock_count(), "acquired for read");
        Ok(transferred)
    }

    /// Pin `object` for writing in the requested representation.
    ///
    /// The object is dirty from this point on. Returns whether a buffer was
    /// allocated (fresh residency or a representation/size change). A dirty
    /// object changing layout is written back before its old buffer is
    /// recycled.
    ///
    /// # Errors
    /// - `ObjectFreed` after `destroy`
    /// - `ObjectInUse` if a layout change is needed while others hold locks
    /// - `DeviceOutOfMemory`, `Allocation`, or `Transfer` (write-back)
    #[tracing::instrument(level = "debug", skip(self, object), fields(id = %object.id()))]
    pub fn acquire_write(&self, object: &Arc<DeviceObject>, sparse: bool) -> DeviceResult<bool> {
        self.check_owner(object)?;
        let representation = Representation::from_sparse_flag(sparse);
        let size_bytes = object.host().shape().size_bytes(representation);

        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let (current, current_representation, current_size) = {
            let slot = object.slot();
            (slot.state, slot.representation, slot.size_bytes)
        };

        let allocated = match current {
            ObjectState::Freed => return Err(DeviceError::ObjectFreed { id: object.id() }),
            ObjectState::AllocatedClean | ObjectState::AllocatedDirty
                if current_representation == representation && current_size == size_bytes =>
            {
                object.slot().mark_dirty();
                false
            }
            ObjectState::AllocatedClean | ObjectState::AllocatedDirty => {
                if object.is_locked() {
                    return Err(DeviceError::ObjectInUse {
                        id: object.id(),
                        lock_count: object.lock_count(),
                    });
                }
                if current == ObjectState::AllocatedDirty {
                    self.download(object)?;
                }
                self.release_binding(state, object, false);
                self.bind_fresh(state, object, representation, size_bytes)?;
                true
            }
            ObjectState::Unallocated => {
                self.bind_fresh(state, object, representation, size_bytes)?;
                true
            }
            ObjectState::Evicting => unreachable!("evicting state escaped the context lock"),
        };

        object.lock_increment(self.tick());
        tracing::debug!(
            allocated,
            %representation,
            size_bytes,
            lock_count = object.lock_count(),
            "acquired for write"
        );
        Ok(allocated)
    }

    /// Drop a read pin.
    ///
    /// # Errors
    /// `InvalidLockState` if no lock is outstanding.
    pub fn release_input(&self, object: &DeviceObject) -> DeviceResult<()> {
        self.check_owner(object)?;
        let remaining = object
            .lock_decrement(self.tick())
            .ok_or_else(|| DeviceError::invalid_lock_state(object.id(), "release_input"))?;
        tracing::debug!(id = %object.id(), remaining, "released input");
        Ok(())
    }

    /// Drop a write pin; the device copy is dirty afterwards.
    ///
    /// # Errors
    /// `InvalidLockState` if no lock is outstanding.
    pub fn release_output(&self, object: &DeviceObject) -> DeviceResult<()> {
        self.check_owner(object)?;
        let _guard = self.inner.lock();

        if !object.is_locked() {
            return Err(DeviceError::invalid_lock_state(object.id(), "release_output"));
        }
        {
            let mut slot = object.slot();
            if slot.state.is_allocated() {
                slot.mark_dirty();
            }
        }

        let remaining = object
            .lock_decrement(self.tick())
            .ok_or_else(|| DeviceError::invalid_lock_state(object.id(), "release_output"))?;
        tracing::debug!(id = %object.id(), remaining, "released output");
        Ok(())
    }

    /// Make the host copy current.
    ///
    /// Copies device to host only when the object is dirty, then marks it
    /// clean; a second call is a no-op. Returns whether a copy happened.
    ///
    /// # Errors
    /// `ObjectFreed` after `destroy`; `Transfer` if the copy fails (the
    /// object stays dirty).
    #[tracing::instrument(level = "debug", skip(self, object), fields(id = %object.id()))]
    pub fn acquire_host_read(&self, object: &DeviceObject) -> DeviceResult<bool> {
        self.check_owner(object)?;
        let _guard = self.inner.lock();
        match object.state() {
            ObjectState::Freed => Err(DeviceError::ObjectFreed { id: object.id() }),
            ObjectState::AllocatedDirty => {
                self.download(object)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release the device copy without write-back.
    ///
    /// `eager` frees the buffer to the allocator; otherwise it is pooled for
    /// reuse. No-op for a non-resident object.
    ///
    /// # Errors
    /// `ObjectFreed` after `destroy`; `ObjectInUse` while locked.
    pub fn clear(&self, object: &DeviceObject, eager: bool) -> DeviceResult<()> {
        self.check_owner(object)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        match object.state() {
            ObjectState::Freed => Err(DeviceError::ObjectFreed { id: object.id() }),
            _ if object.is_locked() => Err(DeviceError::ObjectInUse {
                id: object.id(),
                lock_count: object.lock_count(),
            }),
            ObjectState::AllocatedClean | ObjectState::AllocatedDirty => {
                if object.is_dirty() {
                    tracing::debug!(id = %object.id(), "clearing dirty object without write-back");
                }
                self.release_binding(state, object, eager);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Destroy the object: its buffer is pooled and it becomes `Freed`.
    ///
    /// Idempotent. Frees the matrix id for a later `attach`.
    ///
    /// # Errors
    /// `ObjectInUse` while locked.
    pub fn destroy(&self, object: &DeviceObject) -> DeviceResult<()> {
        self.check_owner(object)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if object.state() == ObjectState::Freed {
            return Ok(());
        }
        if object.is_locked() {
            return Err(DeviceError::ObjectInUse {
                id: object.id(),
                lock_count: object.lock_count(),
            });
        }
        if object.is_resident() {
            self.release_binding(state, object, false);
        }

        object.slot().state = ObjectState::Freed;
        let current = state
            .attached
            .get(&object.id())
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), object));
        if current {
            state.attached.remove(&object.id());
        }
        tracing::debug!(id = %object.id(), "destroyed");
        Ok(())
    }

    /// Adopt a buffer that a side channel allocated and filled.
    ///
    /// The object becomes resident and dirty with `ptr`; a different buffer
    /// it held before goes to the pool. Room for the adopted bytes is made
    /// first, with the object itself held out of eviction. On error the
    /// caller still owns `ptr`.
    ///
    /// # Errors
    /// `ObjectFreed` after `destroy`; `DeviceOutOfMemory` if the adopted
    /// bytes cannot be accounted for.
    pub fn mark_externally_allocated(
        &self,
        object: &Arc<DeviceObject>,
        ptr: DevicePtr,
        representation: Representation,
        size_bytes: usize,
    ) -> DeviceResult<()> {
        self.check_owner(object)?;
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let (current, current_ptr, current_size) = {
            let slot = object.slot();
            (slot.state, slot.buffer, slot.size_bytes)
        };
        if current == ObjectState::Freed {
            return Err(DeviceError::ObjectFreed { id: object.id() });
        }

        let resident = current.is_allocated();
        let extra_bytes = if resident && current_ptr == Some(ptr) {
            size_bytes.saturating_sub(current_size)
        } else {
            size_bytes
        };

        if resident {
            object.pin();
        }
        let room = self.ensure_capacity_locked(state, extra_bytes);
        if resident {
            object.unpin();
        }
        room?;

        if resident {
            let (old_ptr, old_size) = object.slot().unbind();
            state.registry.remove(object.id());
            state.used_bytes -= old_size;
            if old_ptr != ptr {
                self.recycle_buffer(state, old_ptr, old_size);
            }
        }

        object.slot().bind(ptr, representation, size_bytes, true);
        state.used_bytes += size_bytes;
        state.registry.insert(Arc::clone(object));

        tracing::debug!(id = %object.id(), %ptr, size_bytes, "adopted external buffer");
        Ok(())
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Make sure `bytes` are available, draining the pool and then evicting.
    ///
    /// # Errors
    /// `DeviceOutOfMemory` (nothing evicted) or `EvictionWriteBackFailure`.
    #[tracing::instrument(skip(self))]
    pub fn ensure_capacity(&self, bytes: usize) -> DeviceResult<()> {
        let mut guard = self.inner.lock();
        self.ensure_capacity_locked(&mut guard, bytes).map(|_| ())
    }

    /// Same path as an allocation shortfall; returns the bytes reclaimed.
    ///
    /// # Errors
    /// Same as [`DeviceContext::ensure_capacity`].
    #[tracing::instrument(skip(self))]
    pub fn evict(&self, bytes: usize) -> DeviceResult<usize> {
        let mut guard = self.inner.lock();
        self.ensure_capacity_locked(&mut guard, bytes)
    }

    /// Write back every dirty object, free every live and pooled buffer.
    ///
    /// The context stays usable (and empty) afterwards.
    ///
    /// # Errors
    /// `ObjectInUse` if any object is locked (nothing is released);
    /// `EvictionWriteBackFailure` if a write-back fails.
    pub fn shutdown(&self) -> DeviceResult<ShutdownReport> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if let Some(locked) = state.registry.iter().find(|o| o.is_locked()) {
            return Err(DeviceError::ObjectInUse {
                id: locked.id(),
                lock_count: locked.lock_count(),
            });
        }

        let mut report = ShutdownReport::default();
        let objects: Vec<Arc<DeviceObject>> = state.registry.iter().cloned().collect();
        for object in objects {
            let dirty = object.is_dirty();
            let freed = evict_object(
                &object,
                &mut state.registry,
                &mut state.used_bytes,
                self.backend.as_ref(),
                &self.stats,
            )?;
            report.objects_released += 1;
            report.live_bytes_freed += freed;
            if dirty {
                report.objects_written_back += 1;
            }
        }
        report.pooled_bytes_freed = state.pool.drain_all(|ptr| self.free_buffer(ptr));

        // Postconditions
        assert_eq!(state.used_bytes, 0, "live bytes remain after shutdown");
        assert!(state.pool.is_empty(), "pooled buffers remain after shutdown");

        tracing::info!(
            objects_released = report.objects_released,
            objects_written_back = report.objects_written_back,
            pooled_bytes_freed = report.pooled_bytes_freed,
            "device context shut down"
        );
        Ok(report)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Process-unique id stamped on every object this context attaches.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.config.capacity_bytes
    }

    /// Bytes bound to live objects.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    /// Bytes parked in the free pool.
    #[must_use]
    pub fn pooled_bytes(&self) -> usize {
        self.inner.lock().pool.pooled_bytes()
    }

    /// Bytes neither live nor pooled.
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.inner.lock().available_bytes(self.config.capacity_bytes)
    }

    /// Number of resident objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Ids of resident objects, ascending.
    #[must_use]
    pub fn live_ids(&self) -> Vec<MatrixId> {
        self.inner.lock().registry.ids()
    }

    /// Whether `id` is resident.
    #[must_use]
    pub fn is_live(&self, id: MatrixId) -> bool {
        self.inner.lock().registry.contains(id)
    }

    /// Active eviction policy.
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.engine.policy_name()
    }

    /// Configuration the context was built with.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DeviceStatsSnapshot {
        let state = self.inner.lock();
        self.stats.snapshot(state.pool.hits(), state.pool.misses())
    }

    /// Verify the accounting invariants.
    ///
    /// # Errors
    /// Describes the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.inner.lock();

        let resident_bytes = state.registry.resident_bytes();
        if resident_bytes != state.used_bytes {
            return Err(format!(
                "used_bytes {} != resident bytes {}",
                state.used_bytes, resident_bytes
            ));
        }
        let committed = state.used_bytes + state.pool.pooled_bytes();
        if committed > self.config.capacity_bytes {
            return Err(format!(
                "used {} + pooled {} exceeds capacity {}",
                state.used_bytes,
                state.pool.pooled_bytes(),
                self.config.capacity_bytes
            ));
        }
        if let Some(object) = state.registry.iter().find(|o| !o.is_resident()) {
            return Err(format!("registered {} is {}", object.id(), object.state()));
        }
        Ok(())
    }

    // =========================================================================
    // Internals (context lock held)
    // =========================================================================

    fn check_owner(&self, object: &DeviceObject) -> DeviceResult<()> {
        if object.context_id() == self.id {
            return Ok(());
        }
        Err(DeviceError::ForeignObject {
            id: object.id(),
            owner: object.context_id(),
            context: self.id,
        })
    }

    /// Retire an unlocked object no caller holds any more so its matrix id
    /// can be attached again. Dirty data goes home first.
    fn retire_orphan(&self, state: &mut ContextState, object: &DeviceObject) -> DeviceResult<()> {
        // Precondition
        assert!(!object.is_locked(), "orphaned object still locked");

        if object.is_dirty() {
            self.download(object)?;
        }
        if object.is_resident() {
            self.release_binding(state, object, false);
        }
        object.retire();
        state.attached.remove(&object.id());
        tracing::debug!(id = %object.id(), "retired orphaned object");
        Ok(())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn free_buffer(&self, ptr: DevicePtr) {
        self.backend.free(ptr);
        self.stats.record_free();
    }

    /// Return an unbound buffer to the pool (or the allocator when pooling
    /// is off).
    fn recycle_buffer(&self, state: &mut ContextState, ptr: DevicePtr, size_bytes: usize) {
        if self.config.pool_enabled {
            state
                .pool
                .release(ptr, size_bytes, |overflow| self.free_buffer(overflow));
        } else {
            self.free_buffer(ptr);
        }
    }

    /// Unbind, deregister and recycle (or free, if `eager`) the object's buffer.
    fn release_binding(&self, state: &mut ContextState, object: &DeviceObject, eager: bool) {
        let (ptr, size_bytes) = object.slot().unbind();
        state.registry.remove(object.id());
        state.used_bytes -= size_bytes;
        if eager {
            self.free_buffer(ptr);
        } else {
            self.recycle_buffer(state, ptr, size_bytes);
        }
    }

    fn ensure_capacity_locked(&self, state: &mut ContextState, bytes: usize) -> DeviceResult<usize> {
        let capacity_bytes = self.config.capacity_bytes;
        let available_bytes = state.available_bytes(capacity_bytes);
        if available_bytes >= bytes {
            return Ok(0);
        }

        let pooled_bytes = state.pool.pooled_bytes();
        let evictable_bytes: usize = state
            .registry
            .eviction_candidates()
            .iter()
            .map(|c| c.size_bytes)
            .sum();
        let reclaimable_bytes = pooled_bytes + evictable_bytes;
        if available_bytes.saturating_add(reclaimable_bytes) < bytes {
            tracing::warn!(
                requested_bytes = bytes,
                available_bytes,
                reclaimable_bytes,
                "device out of memory"
            );
            return Err(DeviceError::out_of_memory(
                bytes,
                available_bytes,
                reclaimable_bytes,
            ));
        }

        let mut freed_bytes = 0usize;
        while state.available_bytes(capacity_bytes) < bytes {
            match state.pool.drain_oldest(|ptr| self.free_buffer(ptr)) {
                Some(drained) => {
                    self.stats.record_pool_drain();
                    freed_bytes += drained;
                }
                None => break,
            }
        }

        let available_bytes = state.available_bytes(capacity_bytes);
        if available_bytes < bytes {
            freed_bytes += self.engine.evict_until(
                &mut state.registry,
                &mut state.used_bytes,
                self.backend.as_ref(),
                &self.stats,
                bytes - available_bytes,
            )?;
        }

        // Postcondition
        assert!(
            state.available_bytes(capacity_bytes) >= bytes,
            "ensure_capacity returned without room"
        );

        Ok(freed_bytes)
    }

    /// Pool hit first; on a miss make room and call the allocator.
    fn obtain_buffer(&self, state: &mut ContextState, size_bytes: usize) -> DeviceResult<DevicePtr> {
        if self.config.pool_enabled {
            if let Some(ptr) = state.pool.try_acquire(size_bytes) {
                tracing::debug!(size_bytes, %ptr, "pool hit");
                return Ok(ptr);
            }
        }

        self.ensure_capacity_locked(state, size_bytes)?;

        match self.backend.alloc(size_bytes) {
            Ok(ptr) => {
                self.stats.record_allocation();
                Ok(ptr)
            }
            Err(source) if source.is_out_of_memory() => {
                tracing::warn!(size_bytes, error = %source, "allocator refused accounted request");
                Err(DeviceError::out_of_memory(
                    size_bytes,
                    state.available_bytes(self.config.capacity_bytes),
                    0,
                ))
            }
            Err(source) => Err(DeviceError::Allocation {
                requested_bytes: size_bytes,
                source,
            }),
        }
    }

    /// Allocate and bind a buffer with no copy (write path).
    fn bind_fresh(
        &self,
        state: &mut ContextState,
        object: &Arc<DeviceObject>,
        representation: Representation,
        size_bytes: usize,
    ) -> DeviceResult<()> {
        let ptr = self.obtain_buffer(state, size_bytes)?;
        object.slot().bind(ptr, representation, size_bytes, true);
        state.used_bytes += size_bytes;
        state.registry.insert(Arc::clone(object));
        Ok(())
    }

    /// Allocate, copy host contents over, and bind clean (read path).
    fn upload(&self, state: &mut ContextState, object: &Arc<DeviceObject>) -> DeviceResult<()> {
        let id = object.id();
        let (ptr, representation, size_bytes) =
            object.host().with_block(|block| -> DeviceResult<_> {
                let block = block.ok_or(DeviceError::HostDataMissing { id })?;
                let size_bytes = block.size_bytes();
                let ptr = self.obtain_buffer(state, size_bytes)?;

                if let Err(source) = self.backend.copy_host_to_device(ptr, block) {
                    tracing::warn!(%id, error = %source, "host-to-device copy failed");
                    self.recycle_buffer(state, ptr, size_bytes);
                    return Err(DeviceError::Transfer {
                        id,
                        direction: TransferDirection::HostToDevice,
                        source,
                    });
                }
                Ok((ptr, block.representation(), size_bytes))
            })?;

        object.slot().bind(ptr, representation, size_bytes, false);
        state.used_bytes += size_bytes;
        state.registry.insert(Arc::clone(object));
        self.stats.record_host_to_device(size_bytes);
        Ok(())
    }

    /// Copy a dirty object home and mark it clean.
    fn download(&self, object: &DeviceObject) -> DeviceResult<()> {
        let mut slot = object.slot();
        let ptr = slot
            .buffer
            .unwrap_or_else(|| unreachable!("dirty object without a buffer"));
        let shape = object.host().shape();

        match self.backend.copy_device_to_host(ptr, slot.representation, shape) {
            Ok(block) => {
                object.host().replace_block(block);
                slot.mark_clean();
                self.stats.record_device_to_host(slot.size_bytes);
                Ok(())
            }
            Err(source) => {
                tracing::warn!(id = %object.id(), error = %source, "device-to-host copy failed");
                Err(DeviceError::Transfer {
                    id: object.id(),
                    direction: TransferDirection::DeviceToHost,
                    source,
                })
            }
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let backend = &self.backend;
        let state = self.inner.get_mut();

        for object in state.registry.drain() {
            let mut slot = object.slot();
            if !slot.state.is_allocated() {
                continue;
            }
            if slot.is_dirty() {
                tracing::warn!(id = %object.id(), "dropping context discards unsynchronised device data");
            }
            let (ptr, _) = slot.unbind();
            drop(slot);
            backend.free(ptr);
        }
        state.pool.drain_all(|ptr| backend.free(ptr));
        state.used_bytes = 0;

        // Surviving handles hold no buffer and no locks.
        for object in state.attached.values().filter_map(Weak::upgrade) {
            object.retire();
        }
        state.attached.clear();
    }
}
