//! Eviction policies and the engine that applies them.
//!
//! `TigerStyle`: Locked objects are never candidates, deterministic
//! selection, explicit tie-breaking by lowest id.
//!
//! Policies only *choose*; the engine performs write-back, frees buffers and
//! keeps the registry and byte accounting in step.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::config::EvictionPolicyKind;
use crate::device::DeviceBackend;
use crate::error::{DeviceError, DeviceResult};
use crate::host::MatrixId;
use crate::object::{DeviceObject, ObjectState};
use crate::registry::LiveRegistry;
use crate::stats::DeviceStats;

/// What a policy sees of one unlocked, resident object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Object identity
    pub id: MatrixId,
    /// Bytes freed by evicting it
    pub size_bytes: usize,
    /// Logical time of last acquire/release
    pub last_access: u64,
    /// Lifetime acquisitions
    pub access_count: u64,
}

/// Victim selection strategy.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Policy name for logs.
    fn name(&self) -> &'static str;

    /// Choose victims, in eviction order, that together free at least
    /// `shortfall_bytes`.
    ///
    /// # Preconditions
    /// - every candidate is unlocked and resident
    ///
    /// # Postconditions
    /// - returns only ids present in `candidates`, each at most once
    /// - returns an empty vector when `shortfall_bytes` is zero
    fn select_victims(
        &self,
        candidates: &[EvictionCandidate],
        shortfall_bytes: usize,
    ) -> Vec<MatrixId>;
}

/// Take candidates in order until their sizes cover `shortfall_bytes`.
fn take_until<'a>(
    ordered: impl IntoIterator<Item = &'a EvictionCandidate>,
    shortfall_bytes: usize,
) -> Vec<MatrixId> {
    let mut freed = 0usize;
    let mut victims = Vec::new();
    for candidate in ordered {
        if freed >= shortfall_bytes {
            break;
        }
        freed = freed.saturating_add(candidate.size_bytes);
        victims.push(candidate.id);
    }
    victims
}

// =============================================================================
// Policies
// =============================================================================

/// Least recently used first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victims(
        &self,
        candidates: &[EvictionCandidate],
        shortfall_bytes: usize,
    ) -> Vec<MatrixId> {
        let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| (c.last_access, c.id));
        take_until(ordered, shortfall_bytes)
    }
}

/// Least frequently used first; recency then id break ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn select_victims(
        &self,
        candidates: &[EvictionCandidate],
        shortfall_bytes: usize,
    ) -> Vec<MatrixId> {
        let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| (c.access_count, c.last_access, c.id));
        take_until(ordered, shortfall_bytes)
    }
}

/// Fewest bytes wasted: the smallest single object that covers the
/// shortfall, otherwise largest objects first.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinEvictPolicy;

impl EvictionPolicy for MinEvictPolicy {
    fn name(&self) -> &'static str {
        "min_evict"
    }

    fn select_victims(
        &self,
        candidates: &[EvictionCandidate],
        shortfall_bytes: usize,
    ) -> Vec<MatrixId> {
        if shortfall_bytes == 0 {
            return Vec::new();
        }

        let best_fit = candidates
            .iter()
            .filter(|c| c.size_bytes >= shortfall_bytes)
            .min_by_key(|c| (c.size_bytes, c.id));
        if let Some(best) = best_fit {
            return vec![best.id];
        }

        let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| (Reverse(c.size_bytes), c.id));
        take_until(ordered, shortfall_bytes)
    }
}

/// Build the policy for a configured kind.
#[must_use]
pub fn policy_for(kind: EvictionPolicyKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruPolicy),
        EvictionPolicyKind::Lfu => Box::new(LfuPolicy),
        EvictionPolicyKind::MinEvict => Box::new(MinEvictPolicy),
    }
}

// =============================================================================
// EvictionEngine
// =============================================================================

/// Applies a policy to the live registry.
#[derive(Debug)]
pub struct EvictionEngine {
    policy: Box<dyn EvictionPolicy>,
}

impl EvictionEngine {
    /// Create an engine around `policy`.
    #[must_use]
    pub fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self { policy }
    }

    /// Name of the active policy.
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Choose victims that free at least `shortfall_bytes`.
    ///
    /// The policy's choice is validated: unknown or repeated ids are dropped,
    /// and if it falls short the remaining candidates are appended in LRU
    /// order, so a custom policy can never cause an avoidable failure.
    /// Returns an empty plan if even every candidate would not suffice.
    #[must_use]
    pub fn plan(&self, registry: &LiveRegistry, shortfall_bytes: usize) -> Vec<MatrixId> {
        if shortfall_bytes == 0 {
            return Vec::new();
        }

        let candidates = registry.eviction_candidates();
        let evictable_bytes: usize = candidates.iter().map(|c| c.size_bytes).sum();
        if evictable_bytes < shortfall_bytes {
            return Vec::new();
        }

        let known: HashSet<MatrixId> = candidates.iter().map(|c| c.id).collect();
        let mut chosen = HashSet::new();
        let mut victims: Vec<MatrixId> = self
            .policy
            .select_victims(&candidates, shortfall_bytes)
            .into_iter()
            .filter(|id| known.contains(id) && chosen.insert(*id))
            .collect();

        let size_of = |id: &MatrixId| {
            candidates
                .iter()
                .find(|c| c.id == *id)
                .map_or(0, |c| c.size_bytes)
        };
        let planned: usize = victims.iter().map(size_of).sum();
        if planned < shortfall_bytes {
            let rest: Vec<EvictionCandidate> = candidates
                .iter()
                .filter(|c| !chosen.contains(&c.id))
                .copied()
                .collect();
            victims.extend(LruPolicy.select_victims(&rest, shortfall_bytes - planned));
        }

        // Postcondition
        assert!(
            victims.iter().map(size_of).sum::<usize>() >= shortfall_bytes,
            "eviction plan does not cover the shortfall"
        );

        victims
    }

    /// Evict by policy until `shortfall_bytes` have been freed.
    ///
    /// # Errors
    /// - `DeviceOutOfMemory` if the unlocked objects cannot cover the
    ///   shortfall; nothing is evicted in that case.
    /// - `EvictionWriteBackFailure` if a dirty victim cannot be copied home.
    ///   Victims evicted before it stay evicted (their data is safe); the
    ///   failing victim stays resident and dirty.
    pub(crate) fn evict_until(
        &self,
        registry: &mut LiveRegistry,
        used_bytes: &mut usize,
        backend: &dyn DeviceBackend,
        stats: &DeviceStats,
        shortfall_bytes: usize,
    ) -> DeviceResult<usize> {
        let victims = self.plan(registry, shortfall_bytes);
        if victims.is_empty() && shortfall_bytes > 0 {
            let evictable: usize = registry
                .eviction_candidates()
                .iter()
                .map(|c| c.size_bytes)
                .sum();
            return Err(DeviceError::out_of_memory(shortfall_bytes, 0, evictable));
        }

        stats.record_eviction_round();
        tracing::info!(
            policy = self.policy.name(),
            shortfall_bytes,
            victims = victims.len(),
            "evicting live objects"
        );

        let mut freed_bytes = 0usize;
        for id in victims {
            let Some(object) = registry.get(id).cloned() else {
                continue;
            };
            let size_bytes = evict_object(&object, registry, used_bytes, backend, stats)?;
            stats.record_eviction(size_bytes);
            freed_bytes += size_bytes;
        }

        // Postcondition
        assert!(
            freed_bytes >= shortfall_bytes,
            "eviction freed {} of {} bytes",
            freed_bytes,
            shortfall_bytes
        );

        Ok(freed_bytes)
    }
}

/// Write back (if dirty), free and deregister one unlocked object.
///
/// The buffer goes to the allocator, never to the pool: eviction means
/// genuine pressure. Also used by shutdown. Returns the bytes freed.
pub(crate) fn evict_object(
    object: &Arc<DeviceObject>,
    registry: &mut LiveRegistry,
    used_bytes: &mut usize,
    backend: &dyn DeviceBackend,
    stats: &DeviceStats,
) -> DeviceResult<usize> {
    // Preconditions
    assert!(!object.is_locked(), "locked object {} chosen for eviction", object.id());
    assert!(registry.contains(object.id()), "evicting unregistered object");

    let mut slot = object.slot();
    let dirty = slot.is_dirty();
    let ptr = slot
        .buffer
        .unwrap_or_else(|| unreachable!("registered object without a buffer"));
    slot.state = ObjectState::Evicting;

    if dirty {
        let shape = object.host().shape();
        match backend.copy_device_to_host(ptr, slot.representation, shape) {
            Ok(block) => {
                object.host().replace_block(block);
                stats.record_write_back(slot.size_bytes);
            }
            Err(source) => {
                slot.state = ObjectState::AllocatedDirty;
                tracing::warn!(id = %object.id(), error = %source, "write-back failed during eviction");
                return Err(DeviceError::EvictionWriteBackFailure {
                    id: object.id(),
                    source,
                });
            }
        }
    }

    let (ptr, size_bytes) = slot.unbind();
    drop(slot);

    backend.free(ptr);
    stats.record_free();
    registry.remove(object.id());
    *used_bytes -= size_bytes;

    tracing::info!(id = %object.id(), size_bytes, dirty, "released device buffer");
    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, size_bytes: usize, last_access: u64, access_count: u64) -> EvictionCandidate {
        EvictionCandidate {
            id: MatrixId(id),
            size_bytes,
            last_access,
            access_count,
        }
    }

    fn ids(raw: &[u64]) -> Vec<MatrixId> {
        raw.iter().copied().map(MatrixId).collect()
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let candidates = [candidate(1, 300, 5, 1), candidate(2, 300, 2, 9), candidate(3, 300, 8, 1)];
        assert_eq!(LruPolicy.select_victims(&candidates, 300), ids(&[2]));
        assert_eq!(LruPolicy.select_victims(&candidates, 301), ids(&[2, 1]));
    }

    #[test]
    fn test_lru_ties_break_by_lowest_id() {
        let candidates = [candidate(7, 10, 1, 0), candidate(3, 10, 1, 0)];
        assert_eq!(LruPolicy.select_victims(&candidates, 10), ids(&[3]));
    }

    #[test]
    fn test_lfu_uses_frequency_before_recency() {
        let candidates = [candidate(1, 100, 1, 5), candidate(2, 100, 9, 1)];
        assert_eq!(LfuPolicy.select_victims(&candidates, 100), ids(&[2]));
        assert_eq!(LruPolicy.select_victims(&candidates, 100), ids(&[1]));
    }

    #[test]
    fn test_min_evict_best_fit() {
        let candidates = [candidate(1, 100, 0, 0), candidate(2, 500, 0, 0), candidate(3, 260, 0, 0)];
        assert_eq!(MinEvictPolicy.select_victims(&candidates, 250), ids(&[3]));
    }

    #[test]
    fn test_min_evict_falls_back_to_largest_first() {
        let candidates = [candidate(1, 100, 0, 0), candidate(2, 200, 0, 0), candidate(3, 150, 0, 0)];
        assert_eq!(MinEvictPolicy.select_victims(&candidates, 320), ids(&[2, 3]));
    }

    #[test]
    fn test_min_evict_ties_break_by_lowest_id() {
        let candidates = [candidate(9, 300, 0, 0), candidate(4, 300, 0, 0)];
        assert_eq!(MinEvictPolicy.select_victims(&candidates, 250), ids(&[4]));
    }

    #[test]
    fn test_zero_shortfall_selects_nothing() {
        let candidates = [candidate(1, 100, 0, 0)];
        for policy in [
            policy_for(EvictionPolicyKind::Lru),
            policy_for(EvictionPolicyKind::Lfu),
            policy_for(EvictionPolicyKind::MinEvict),
        ] {
            assert!(policy.select_victims(&candidates, 0).is_empty(), "{}", policy.name());
        }
    }

    #[test]
    fn test_policy_for_names() {
        assert_eq!(policy_for(EvictionPolicyKind::Lru).name(), "lru");
        assert_eq!(policy_for(EvictionPolicyKind::Lfu).name(), "lfu");
        assert_eq!(policy_for(EvictionPolicyKind::MinEvict).name(), "min_evict");
    }
}
