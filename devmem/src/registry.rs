//! Live registry: every object that currently holds a device buffer.
//!
//! Ordered by `MatrixId` so iteration (and therefore eviction planning) is
//! deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::eviction::EvictionCandidate;
use crate::host::MatrixId;
use crate::object::DeviceObject;

/// Set of resident objects, owned by a `DeviceContext`.
#[derive(Debug, Default)]
pub struct LiveRegistry {
    objects: BTreeMap<MatrixId, Arc<DeviceObject>>,
}

impl LiveRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resident object. Returns false if it was already present.
    pub fn insert(&mut self, object: Arc<DeviceObject>) -> bool {
        // Precondition
        assert!(object.is_resident(), "only resident objects are registered");
        self.objects.insert(object.id(), object).is_none()
    }

    /// Remove an object by id.
    pub fn remove(&mut self, id: MatrixId) -> Option<Arc<DeviceObject>> {
        self.objects.remove(&id)
    }

    /// Look up an object by id.
    #[must_use]
    pub fn get(&self, id: MatrixId) -> Option<&Arc<DeviceObject>> {
        self.objects.get(&id)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: MatrixId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of resident objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Registered ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<MatrixId> {
        self.objects.keys().copied().collect()
    }

    /// Iterate over registered objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceObject>> {
        self.objects.values()
    }

    /// Sum of resident footprints.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.objects.values().map(|o| o.size_bytes()).sum()
    }

    /// Unlocked objects, the only legal eviction targets.
    ///
    /// Must be called under the context lock: new locks are only taken
    /// under that lock, so an object seen unlocked here stays evictable for
    /// the rest of the critical section.
    #[must_use]
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.objects
            .values()
            .filter(|o| !o.is_locked())
            .map(|o| EvictionCandidate {
                id: o.id(),
                size_bytes: o.size_bytes(),
                last_access: o.last_access(),
                access_count: o.access_count(),
            })
            .collect()
    }

    /// Remove and return every object.
    pub(crate) fn drain(&mut self) -> Vec<Arc<DeviceObject>> {
        std::mem::take(&mut self.objects).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePtr;
    use crate::host::{HostBlock, HostMatrix};
    use devmem_core::Representation;

    fn resident(id: u64, size: usize) -> Arc<DeviceObject> {
        let host = Arc::new(HostMatrix::new(id, HostBlock::filled(1, 1, 0.0)));
        let obj = Arc::new(DeviceObject::new(host, 0));
        obj.slot().bind(DevicePtr(id), Representation::Dense, size, false);
        obj
    }

    #[test]
    fn test_insert_remove() {
        let mut registry = LiveRegistry::new();
        assert!(registry.insert(resident(2, 10)));
        assert!(registry.insert(resident(1, 20)));
        assert!(!registry.insert(resident(1, 20)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![MatrixId(1), MatrixId(2)]);
        assert_eq!(registry.resident_bytes(), 30);

        assert!(registry.remove(MatrixId(1)).is_some());
        assert!(!registry.contains(MatrixId(1)));
        assert!(registry.remove(MatrixId(1)).is_none());
    }

    #[test]
    fn test_locked_objects_are_not_candidates() {
        let mut registry = LiveRegistry::new();
        let locked = resident(1, 10);
        locked.lock_increment(1);
        registry.insert(locked);
        registry.insert(resident(2, 20));

        let candidates = registry.eviction_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, MatrixId(2));
        assert_eq!(candidates[0].size_bytes, 20);
    }

    #[test]
    #[should_panic(expected = "only resident objects are registered")]
    fn test_unallocated_object_rejected() {
        let mut registry = LiveRegistry::new();
        let host = Arc::new(HostMatrix::new(1, HostBlock::filled(1, 1, 0.0)));
        let obj = Arc::new(DeviceObject::new(host, 0));
        registry.insert(obj);
    }
}
