//! Eviction, write-back and pooling scenarios against the simulated device.

mod common;

use std::sync::Arc;

use common::{context, dense, sparse, touch};
use devmem::{
    DeviceContext, DeviceError, DeviceObject, EvictionPolicyKind, HostBlock, MatrixId,
    ObjectState, SimDevice,
};

// =============================================================================
// Locked objects and LRU
// =============================================================================

/// X (800B) locked and dirty, Y and Z (300B each) resident with Y older.
fn three_objects(
    lock_y_and_z: bool,
) -> (DeviceContext, Arc<SimDevice>, [Arc<DeviceObject>; 3]) {
    let (ctx, device) = context(1400, EvictionPolicyKind::Lru);

    let x = ctx.attach(dense(1, 800, 0.0)).unwrap();
    let y = ctx.attach(sparse(2, 3, 24, 1.0)).unwrap();
    let z = ctx.attach(sparse(3, 3, 24, 1.0)).unwrap();

    ctx.acquire_write(&x, false).unwrap();
    if lock_y_and_z {
        ctx.acquire_read(&y).unwrap();
        ctx.acquire_read(&z).unwrap();
    } else {
        touch(&ctx, &y);
        touch(&ctx, &z);
    }

    assert_eq!(x.size_bytes(), 800);
    assert_eq!(y.size_bytes(), 300);
    assert_eq!(z.size_bytes(), 300);
    assert_eq!(ctx.available_bytes(), 0);
    assert!(y.last_access() < z.last_access());

    (ctx, device, [x, y, z])
}

#[test]
fn test_lru_evicts_only_the_oldest_unlocked_object() {
    let (ctx, _device, [x, y, z]) = three_objects(false);

    let freed = ctx.evict(300).unwrap();

    assert_eq!(freed, 300);
    assert_eq!(y.state(), ObjectState::Unallocated);
    assert_eq!(z.state(), ObjectState::AllocatedClean);
    assert_eq!(x.state(), ObjectState::AllocatedDirty);
    assert_eq!(x.lock_count(), 1);
    assert_eq!(ctx.live_ids(), vec![MatrixId(1), MatrixId(3)]);
    assert!(ctx.available_bytes() >= 300);
    assert!(ctx.check_invariants().is_ok());
}

#[test]
fn test_ensure_capacity_grants_room_by_evicting() {
    let (ctx, _device, [_x, y, _z]) = three_objects(false);

    ctx.ensure_capacity(300).unwrap();

    assert!(ctx.available_bytes() >= 300);
    assert!(!y.is_resident());
    let stats = ctx.stats();
    assert_eq!(stats.eviction_rounds, 1);
    assert_eq!(stats.objects_evicted, 1);
    assert_eq!(stats.bytes_evicted, 300);
}

#[test]
fn test_all_locked_means_out_of_memory_and_no_eviction() {
    let (ctx, device, [x, y, z]) = three_objects(true);
    let allocs_before = device.stats().allocs;

    let err = ctx.evict(300).unwrap_err();

    assert!(err.is_out_of_memory(), "{err}");
    assert!(matches!(
        err,
        DeviceError::DeviceOutOfMemory {
            requested_bytes: 300,
            available_bytes: 0,
            reclaimable_bytes: 0,
        }
    ));
    for object in [&x, &y, &z] {
        assert!(object.is_resident());
        assert_eq!(object.lock_count(), 1);
    }
    assert_eq!(x.state(), ObjectState::AllocatedDirty);
    assert_eq!(ctx.live_count(), 3);
    assert_eq!(ctx.stats().eviction_rounds, 0);
    assert_eq!(device.stats().frees, 0);
    assert_eq!(device.stats().allocs, allocs_before);
}

#[test]
fn test_acquire_fails_without_partial_eviction() {
    let (ctx, _device, [_x, y, _z]) = three_objects(false);
    ctx.acquire_read(&y).unwrap();

    // Z alone (300B) cannot cover 400B and Y is locked.
    let w = ctx.attach(dense(4, 400, 1.0)).unwrap();
    let err = ctx.acquire_read(&w).unwrap_err();

    assert!(matches!(
        err,
        DeviceError::DeviceOutOfMemory {
            requested_bytes: 400,
            reclaimable_bytes: 300,
            ..
        }
    ));
    assert_eq!(ctx.live_count(), 3);
    assert_eq!(w.state(), ObjectState::Unallocated);
    assert_eq!(w.lock_count(), 0);
}

// =============================================================================
// Policies
// =============================================================================

#[test]
fn test_min_evict_prefers_smallest_sufficient_object() {
    let (ctx, _device) = context(860, EvictionPolicyKind::MinEvict);
    let a = ctx.attach(sparse(1, 1, 8, 1.0)).unwrap();
    let b = ctx.attach(sparse(2, 2, 41, 1.0)).unwrap();
    let c = ctx.attach(sparse(3, 2, 21, 1.0)).unwrap();
    for object in [&a, &b, &c] {
        touch(&ctx, object);
    }
    assert_eq!(
        [a.size_bytes(), b.size_bytes(), c.size_bytes()],
        [100, 500, 260]
    );

    let freed = ctx.evict(250).unwrap();

    assert_eq!(freed, 260);
    assert!(!c.is_resident());
    assert!(a.is_resident());
    assert!(b.is_resident());
}

#[test]
fn test_min_evict_falls_back_to_largest_objects() {
    let (ctx, _device) = context(860, EvictionPolicyKind::MinEvict);
    let a = ctx.attach(sparse(1, 1, 8, 1.0)).unwrap();
    let b = ctx.attach(sparse(2, 2, 41, 1.0)).unwrap();
    let c = ctx.attach(sparse(3, 2, 21, 1.0)).unwrap();
    for object in [&a, &b, &c] {
        touch(&ctx, object);
    }

    // No single object covers 600B: evict B (500) then C (260).
    assert_eq!(ctx.evict(600).unwrap(), 760);
    assert_eq!(ctx.live_ids(), vec![MatrixId(1)]);
}

#[test]
fn test_min_evict_sizes_victims_against_the_shortfall() {
    // 140B already free: a 350B request only needs 210B more.
    let (ctx, _device) = context(1000, EvictionPolicyKind::MinEvict);
    let a = ctx.attach(sparse(1, 1, 8, 1.0)).unwrap();
    let b = ctx.attach(sparse(2, 2, 41, 1.0)).unwrap();
    let c = ctx.attach(sparse(3, 2, 21, 1.0)).unwrap();
    for object in [&a, &b, &c] {
        touch(&ctx, object);
    }
    assert_eq!(ctx.available_bytes(), 140);

    // C (260) covers the shortfall; B (500) would only be needed to cover
    // the whole request.
    assert_eq!(ctx.evict(350).unwrap(), 260);
    assert!(!c.is_resident());
    assert!(a.is_resident());
    assert!(b.is_resident());
    assert_eq!(ctx.available_bytes(), 400);
}

#[test]
fn test_lfu_and_lru_disagree_on_hot_old_object() {
    for (policy, survivor) in [
        (EvictionPolicyKind::Lru, MatrixId(2)),
        (EvictionPolicyKind::Lfu, MatrixId(1)),
    ] {
        let (ctx, _device) = context(160, policy);
        let hot = ctx.attach(dense(1, 80, 1.0)).unwrap();
        let cold = ctx.attach(dense(2, 80, 1.0)).unwrap();

        for _ in 0..3 {
            touch(&ctx, &hot);
        }
        touch(&ctx, &cold);

        ctx.evict(80).unwrap();
        assert_eq!(ctx.live_ids(), vec![survivor], "{policy}");
    }
}

// =============================================================================
// Write-back
// =============================================================================

#[test]
#[allow(clippy::approx_constant)]
fn test_dirty_eviction_writes_back_latest_value() {
    let (ctx, device) = context(8, EvictionPolicyKind::Lru);
    let host = dense(1, 8, 0.0);
    let object = ctx.attach(Arc::clone(&host)).unwrap();

    ctx.acquire_write(&object, false).unwrap();
    device
        .write(object.device_ptr().unwrap(), HostBlock::filled(1, 1, 3.14))
        .unwrap();
    ctx.release_output(&object).unwrap();
    assert_eq!(host.get(0, 0), Some(0.0));

    ctx.evict(8).unwrap();

    assert_eq!(object.state(), ObjectState::Unallocated);
    assert_eq!(host.get(0, 0), Some(3.14));
    assert!(!ctx.acquire_host_read(&object).unwrap());
    assert_eq!(host.get(0, 0), Some(3.14));
    assert_eq!(ctx.stats().write_backs, 1);
}

#[test]
fn test_no_data_loss_under_every_policy() {
    for policy in [
        EvictionPolicyKind::Lru,
        EvictionPolicyKind::Lfu,
        EvictionPolicyKind::MinEvict,
    ] {
        let (ctx, device) = context(64, policy);
        let objects: Vec<_> = (0..4u64)
            .map(|id| ctx.attach(dense(id, 32, 0.0)).unwrap())
            .collect();

        for (i, object) in objects.iter().enumerate() {
            ctx.acquire_write(object, false).unwrap();
            device
                .write(
                    object.device_ptr().unwrap(),
                    HostBlock::filled(1, 4, i as f64 + 1.0),
                )
                .unwrap();
            ctx.release_output(object).unwrap();
        }

        for (i, object) in objects.iter().enumerate() {
            ctx.acquire_host_read(object).unwrap();
            assert_eq!(object.host().get(0, 3), Some(i as f64 + 1.0), "{policy}");
        }
        assert!(ctx.stats().write_backs >= 2, "{policy}");
        assert!(ctx.check_invariants().is_ok());
    }
}

#[test]
fn test_host_read_copies_at_most_once() {
    let (ctx, device) = context(64, EvictionPolicyKind::Lru);
    let object = ctx.attach(dense(1, 16, 0.0)).unwrap();
    ctx.acquire_write(&object, false).unwrap();
    ctx.release_output(&object).unwrap();

    assert!(ctx.acquire_host_read(&object).unwrap());
    assert!(!ctx.acquire_host_read(&object).unwrap());
    assert_eq!(device.stats().device_to_host_copies, 1);
    assert_eq!(object.state(), ObjectState::AllocatedClean);
}

// =============================================================================
// Free pool
// =============================================================================

#[test]
fn test_pool_hit_avoids_eviction() {
    let (ctx, device) = context(160, EvictionPolicyKind::Lru);
    let a = ctx.attach(dense(1, 80, 1.0)).unwrap();
    let b = ctx.attach(dense(2, 80, 2.0)).unwrap();
    let c = ctx.attach(dense(3, 80, 3.0)).unwrap();

    touch(&ctx, &a);
    touch(&ctx, &b);
    ctx.clear(&a, false).unwrap();
    assert_eq!(ctx.pooled_bytes(), 80);
    assert_eq!(ctx.available_bytes(), 0);

    assert!(ctx.acquire_read(&c).unwrap());

    assert!(b.is_resident());
    assert_eq!(ctx.pooled_bytes(), 0);
    let stats = ctx.stats();
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.eviction_rounds, 0);
    assert_eq!(device.stats().allocs, 2);
}

#[test]
fn test_pool_drained_before_live_objects() {
    let (ctx, _device) = context(160, EvictionPolicyKind::Lru);
    let a = ctx.attach(dense(1, 80, 1.0)).unwrap();
    let b = ctx.attach(dense(2, 80, 2.0)).unwrap();
    let small = ctx.attach(dense(3, 40, 3.0)).unwrap();

    touch(&ctx, &a);
    touch(&ctx, &b);
    ctx.clear(&a, false).unwrap();

    touch(&ctx, &small);

    assert!(b.is_resident());
    assert_eq!(ctx.pooled_bytes(), 0);
    let stats = ctx.stats();
    assert_eq!(stats.pool_drains, 1);
    assert_eq!(stats.eviction_rounds, 0);
    assert!(ctx.check_invariants().is_ok());
}

#[test]
fn test_capacity_granted_after_ensure_capacity() {
    let (ctx, _device) = context(1024, EvictionPolicyKind::Lru);
    let objects: Vec<_> = (0..8u64)
        .map(|id| ctx.attach(dense(id, 128, 1.0)).unwrap())
        .collect();
    for object in &objects {
        touch(&ctx, object);
    }
    ctx.clear(&objects[0], false).unwrap();

    for request in [0, 64, 128, 200, 512, 1024] {
        ctx.ensure_capacity(request).unwrap();
        assert!(ctx.available_bytes() >= request, "request {request}");
        assert!(ctx.check_invariants().is_ok());
    }
    assert!(ctx.ensure_capacity(1025).unwrap_err().is_out_of_memory());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_clear_discards_device_writes() {
    let (ctx, device) = context(64, EvictionPolicyKind::Lru);
    let host = dense(1, 8, 1.0);
    let object = ctx.attach(Arc::clone(&host)).unwrap();

    ctx.acquire_write(&object, false).unwrap();
    device
        .write(object.device_ptr().unwrap(), HostBlock::filled(1, 1, 9.0))
        .unwrap();
    ctx.release_output(&object).unwrap();
    ctx.clear(&object, true).unwrap();

    assert_eq!(host.get(0, 0), Some(1.0));
    assert_eq!(ctx.pooled_bytes(), 0);
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn test_shutdown_releases_everything() {
    let (ctx, device) = context(256, EvictionPolicyKind::Lru);
    let objects: Vec<_> = (0..4u64)
        .map(|id| ctx.attach(dense(id, 32, 0.0)).unwrap())
        .collect();
    for object in &objects {
        ctx.acquire_write(object, false).unwrap();
        ctx.release_output(object).unwrap();
    }
    ctx.clear(&objects[3], false).unwrap();

    let report = ctx.shutdown().unwrap();

    assert_eq!(report.objects_released, 3);
    assert_eq!(report.objects_written_back, 3);
    assert_eq!(report.live_bytes_freed, 96);
    assert_eq!(report.pooled_bytes_freed, 32);
    assert_eq!(device.allocated_bytes(), 0);
    assert_eq!(ctx.used_bytes() + ctx.pooled_bytes(), 0);

    // The context is empty but usable.
    touch(&ctx, &objects[0]);
    assert_eq!(ctx.live_count(), 1);
}
