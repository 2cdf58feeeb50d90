//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use devmem::{
    CsrBlock, DeviceBackend, DeviceConfig, DeviceContext, DeviceObject, EvictionPolicyKind,
    FaultConfig, FaultInjectorBuilder, DeterministicRng, HostBlock, HostMatrix, SimDevice,
};

/// Context over a fault-free simulated device.
pub fn context(capacity_bytes: usize, policy: EvictionPolicyKind) -> (DeviceContext, Arc<SimDevice>) {
    devmem::telemetry::init_test_telemetry();
    DeviceContext::sim(
        DeviceConfig::default()
            .with_capacity_bytes(capacity_bytes)
            .with_eviction_policy(policy),
    )
    .expect("valid config")
}

/// Context over a simulated device that injects `faults`.
pub fn faulty_context(
    capacity_bytes: usize,
    seed: u64,
    faults: Vec<FaultConfig>,
) -> (DeviceContext, Arc<SimDevice>) {
    devmem::telemetry::init_test_telemetry();
    let injector = faults
        .into_iter()
        .fold(FaultInjectorBuilder::new(DeterministicRng::new(seed)), |b, f| {
            b.with_fault(f)
        })
        .build();
    let device = Arc::new(SimDevice::with_faults(capacity_bytes, Arc::new(injector)));
    let ctx = DeviceContext::new(
        Arc::clone(&device) as Arc<dyn DeviceBackend>,
        DeviceConfig::default().with_capacity_bytes(capacity_bytes),
    )
    .expect("valid config");
    (ctx, device)
}

/// Dense `1 x (bytes / 8)` matrix filled with `value`.
pub fn dense(id: u64, bytes: usize, value: f64) -> Arc<HostMatrix> {
    assert_eq!(bytes % 8, 0, "dense sizes are multiples of 8");
    Arc::new(HostMatrix::new(id, HostBlock::filled(1, bytes / 8, value)))
}

/// Sparse matrix with `rows` rows and `nnz` nonzeros, all in row 0.
///
/// Footprint is `nnz * 12 + rows * 4`.
pub fn sparse(id: u64, rows: usize, nnz: usize, value: f64) -> Arc<HostMatrix> {
    let cols = nnz.max(1);
    let mut row_ptr = vec![nnz as u32; rows + 1];
    row_ptr[0] = 0;
    let col_idx = (0..nnz as u32).collect();
    let block = CsrBlock::new(rows, cols, row_ptr, col_idx, vec![value; nnz]);
    Arc::new(HostMatrix::new(id, HostBlock::Sparse(block)))
}

/// Acquire for read and release straight away (object ends resident, clean).
pub fn touch(ctx: &DeviceContext, object: &Arc<DeviceObject>) {
    ctx.acquire_read(object).expect("acquire_read");
    ctx.release_input(object).expect("release_input");
}
