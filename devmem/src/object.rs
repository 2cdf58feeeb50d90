//! Per-matrix device residency state machine.
//!
//! `TigerStyle`: Explicit states, assertion-guarded transitions.
//!
//! ```text
//! Unallocated ──acquire──▶ AllocatedClean ◀──host read── AllocatedDirty
//!      ▲                        │   └────────write────────────▶│
//!      │                        ▼                              ▼
//!      └──────────────────── Evicting ◀────────────────────────┘
//!
//! any non-locked state ──destroy──▶ Freed (terminal)
//! ```
//!
//! `lock_count` is atomic so releases compose across threads without the
//! context lock. Every other transition happens under the owning
//! `DeviceContext`'s lock, which is always taken before an object's slot.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use devmem_core::Representation;

use crate::device::DevicePtr;
use crate::host::{HostMatrix, MatrixId};

/// Residency state of a `DeviceObject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    /// No device buffer; the host copy is authoritative
    Unallocated,
    /// Device buffer matches the host copy
    AllocatedClean,
    /// Device buffer holds writes the host has not seen
    AllocatedDirty,
    /// Being written back and released
    Evicting,
    /// Destroyed; no further use allowed
    Freed,
}

impl ObjectState {
    /// Get the state name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unallocated => "unallocated",
            Self::AllocatedClean => "allocated_clean",
            Self::AllocatedDirty => "allocated_dirty",
            Self::Evicting => "evicting",
            Self::Freed => "freed",
        }
    }

    /// Whether a device buffer is bound in this state.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        matches!(self, Self::AllocatedClean | Self::AllocatedDirty)
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable residency fields, guarded by the object's slot mutex.
#[derive(Debug)]
pub(crate) struct ObjectSlot {
    pub(crate) state: ObjectState,
    pub(crate) representation: Representation,
    pub(crate) size_bytes: usize,
    pub(crate) buffer: Option<DevicePtr>,
}

impl ObjectSlot {
    /// Bind a buffer; the object becomes resident.
    pub(crate) fn bind(
        &mut self,
        ptr: DevicePtr,
        representation: Representation,
        size_bytes: usize,
        dirty: bool,
    ) {
        // Precondition
        assert_eq!(
            self.state,
            ObjectState::Unallocated,
            "bind requires an unallocated object"
        );

        self.buffer = Some(ptr);
        self.representation = representation;
        self.size_bytes = size_bytes;
        self.state = if dirty {
            ObjectState::AllocatedDirty
        } else {
            ObjectState::AllocatedClean
        };
    }

    /// Drop the buffer binding and return it with its size.
    pub(crate) fn unbind(&mut self) -> (DevicePtr, usize) {
        // Precondition
        assert!(
            matches!(
                self.state,
                ObjectState::AllocatedClean | ObjectState::AllocatedDirty | ObjectState::Evicting
            ),
            "unbind of non-resident object in state {}",
            self.state
        );

        let ptr = self
            .buffer
            .take()
            .unwrap_or_else(|| unreachable!("resident object without a buffer"));
        self.state = ObjectState::Unallocated;
        (ptr, self.size_bytes)
    }

    pub(crate) fn mark_dirty(&mut self) {
        assert!(self.state.is_allocated(), "only resident objects can be dirty");
        self.state = ObjectState::AllocatedDirty;
    }

    pub(crate) fn mark_clean(&mut self) {
        assert!(self.state.is_allocated(), "only resident objects can be clean");
        self.state = ObjectState::AllocatedClean;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state == ObjectState::AllocatedDirty
    }
}

/// Device-side mirror of one host matrix.
#[derive(Debug)]
pub struct DeviceObject {
    id: MatrixId,
    context_id: u64,
    host: Arc<HostMatrix>,
    lock_count: AtomicU32,
    last_access: AtomicU64,
    access_count: AtomicU64,
    slot: Mutex<ObjectSlot>,
}

impl DeviceObject {
    /// Create an unallocated object for `host`, owned by context `context_id`.
    #[must_use]
    pub(crate) fn new(host: Arc<HostMatrix>, context_id: u64) -> Self {
        let representation = host
            .with_block(|block| block.map(|b| b.representation()))
            .unwrap_or(Representation::Dense);

        Self {
            id: host.id(),
            context_id,
            host,
            lock_count: AtomicU32::new(0),
            last_access: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            slot: Mutex::new(ObjectSlot {
                state: ObjectState::Unallocated,
                representation,
                size_bytes: 0,
                buffer: None,
            }),
        }
    }

    /// Identity of the owning host matrix.
    #[must_use]
    pub fn id(&self) -> MatrixId {
        self.id
    }

    /// Id of the `DeviceContext` that attached this object.
    #[must_use]
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// The host matrix this object mirrors.
    #[must_use]
    pub fn host(&self) -> &Arc<HostMatrix> {
        &self.host
    }

    /// Current residency state.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        self.slot.lock().state
    }

    /// Outstanding acquisitions.
    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    /// Whether at least one acquisition is outstanding.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// Whether the device copy holds unsynchronised writes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.slot.lock().is_dirty()
    }

    /// Whether a device buffer is bound.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.slot.lock().state.is_allocated()
    }

    /// Layout of the device copy (or of the last one).
    #[must_use]
    pub fn representation(&self) -> Representation {
        self.slot.lock().representation
    }

    /// Device footprint while resident, zero otherwise.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let slot = self.slot.lock();
        if slot.state.is_allocated() {
            slot.size_bytes
        } else {
            0
        }
    }

    /// Bound device buffer, if resident.
    #[must_use]
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.slot.lock().buffer
    }

    /// Logical time of the last acquire or release.
    #[must_use]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Number of acquisitions over the object's lifetime.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Acquire)
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, ObjectSlot> {
        self.slot.lock()
    }

    /// Take one lock. Only called under the context lock on a resident object.
    pub(crate) fn lock_increment(&self, tick: u64) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
        self.access_count.fetch_add(1, Ordering::AcqRel);
        self.touch(tick);
    }

    /// Drop one lock. Returns the remaining count, or `None` if no lock was
    /// held (the count stays at zero).
    pub(crate) fn lock_decrement(&self, tick: u64) -> Option<u32> {
        let previous = self
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()?;
        self.touch(tick);
        Some(previous - 1)
    }

    /// Hold the object out of eviction for the rest of a critical section
    /// without counting an access.
    pub(crate) fn pin(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let previous = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unpin without pin");
    }

    /// Retire the object when its context goes away: outstanding locks are
    /// dropped and the object becomes `Freed`.
    pub(crate) fn retire(&self) {
        let mut slot = self.slot.lock();
        // Precondition
        assert!(
            !slot.state.is_allocated() && slot.state != ObjectState::Evicting,
            "retire of resident object in state {}",
            slot.state
        );
        slot.state = ObjectState::Freed;
        self.lock_count.store(0, Ordering::Release);
    }

    /// Refresh recency; never moves backwards.
    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBlock;

    fn object() -> DeviceObject {
        DeviceObject::new(Arc::new(HostMatrix::new(1, HostBlock::filled(2, 2, 1.0))), 0)
    }

    #[test]
    fn test_new_object_is_unallocated() {
        let obj = object();
        assert_eq!(obj.id(), MatrixId(1));
        assert_eq!(obj.state(), ObjectState::Unallocated);
        assert_eq!(obj.lock_count(), 0);
        assert_eq!(obj.size_bytes(), 0);
        assert!(obj.device_ptr().is_none());
        assert!(!obj.is_dirty());
    }

    #[test]
    fn test_bind_unbind() {
        let obj = object();
        obj.slot().bind(DevicePtr(0x100), Representation::Dense, 32, false);
        assert_eq!(obj.state(), ObjectState::AllocatedClean);
        assert_eq!(obj.size_bytes(), 32);
        assert_eq!(obj.device_ptr(), Some(DevicePtr(0x100)));

        obj.slot().mark_dirty();
        assert!(obj.is_dirty());

        let (ptr, size) = obj.slot().unbind();
        assert_eq!((ptr, size), (DevicePtr(0x100), 32));
        assert_eq!(obj.state(), ObjectState::Unallocated);
        assert!(obj.device_ptr().is_none());
    }

    #[test]
    #[should_panic(expected = "bind requires an unallocated object")]
    fn test_double_bind_panics() {
        let obj = object();
        obj.slot().bind(DevicePtr(1), Representation::Dense, 32, false);
        obj.slot().bind(DevicePtr(2), Representation::Dense, 32, false);
    }

    #[test]
    fn test_lock_counting_floors_at_zero() {
        let obj = object();
        obj.lock_increment(1);
        obj.lock_increment(2);
        assert_eq!(obj.lock_count(), 2);
        assert_eq!(obj.access_count(), 2);

        assert_eq!(obj.lock_decrement(3), Some(1));
        assert_eq!(obj.lock_decrement(4), Some(0));
        assert_eq!(obj.lock_decrement(5), None);
        assert_eq!(obj.lock_count(), 0);
        assert_eq!(obj.last_access(), 4);
    }

    #[test]
    fn test_retire_drops_locks() {
        let obj = object();
        obj.slot().bind(DevicePtr(1), Representation::Dense, 32, false);
        obj.lock_increment(1);
        obj.slot().unbind();

        obj.retire();
        assert_eq!(obj.state(), ObjectState::Freed);
        assert_eq!(obj.lock_count(), 0);
        assert_eq!(obj.lock_decrement(2), None);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let obj = object();
        obj.touch(10);
        obj.touch(5);
        assert_eq!(obj.last_access(), 10);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ObjectState::AllocatedDirty.to_string(), "allocated_dirty");
        assert!(ObjectState::AllocatedClean.is_allocated());
        assert!(!ObjectState::Evicting.is_allocated());
    }
}
