//! `SimDevice` - Simulated Accelerator
//!
//! `TigerStyle`: In-memory device with a hard capacity, deterministic
//! pointers and DST fault injection on every primitive.
//!
//! Buffers store whole `HostBlock`s, so a test can play the role of a kernel
//! (`write`) and observe exactly what a write-back carries home.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use devmem_core::dst::{
    DeterministicRng, FaultInjector, FaultType, OP_COPY_DEVICE_TO_HOST, OP_COPY_HOST_TO_DEVICE,
    OP_DEVICE_ALLOC,
};
use devmem_core::{MatrixShape, Representation};

use super::{BackendError, DeviceBackend, DevicePtr};
use crate::constants::{SIM_DEVICE_ALIGNMENT_BYTES, SIM_DEVICE_BASE_ADDRESS};
use crate::host::HostBlock;

/// Primitive call counters of a `SimDevice`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDeviceStats {
    /// Successful allocations
    pub allocs: u64,
    /// Successful frees
    pub frees: u64,
    /// Frees of unknown pointers (double free / use after free)
    pub invalid_frees: u64,
    /// Successful host-to-device copies
    pub host_to_device_copies: u64,
    /// Successful device-to-host copies
    pub device_to_host_copies: u64,
}

#[derive(Debug)]
struct SimBuffer {
    bytes: usize,
    contents: Option<HostBlock>,
}

#[derive(Debug)]
struct SimDeviceState {
    next_address: u64,
    buffers: HashMap<DevicePtr, SimBuffer>,
    allocated_bytes: usize,
    stats: SimDeviceStats,
}

/// In-memory accelerator for tests and simulation.
#[derive(Debug)]
pub struct SimDevice {
    capacity_bytes: usize,
    faults: Arc<FaultInjector>,
    state: Mutex<SimDeviceState>,
}

impl SimDevice {
    /// Create a fault-free device with the given capacity.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self::with_faults(capacity_bytes, Arc::new(FaultInjector::disabled()))
    }

    /// Create a device whose primitives consult `faults`.
    #[must_use]
    pub fn with_faults(capacity_bytes: usize, faults: Arc<FaultInjector>) -> Self {
        Self {
            capacity_bytes,
            faults,
            state: Mutex::new(SimDeviceState {
                next_address: SIM_DEVICE_BASE_ADDRESS,
                buffers: HashMap::new(),
                allocated_bytes: 0,
                stats: SimDeviceStats::default(),
            }),
        }
    }

    /// Create a device with a seeded, initially empty fault injector.
    #[must_use]
    pub fn with_seed(capacity_bytes: usize, seed: u64) -> Self {
        Self::with_faults(
            capacity_bytes,
            Arc::new(FaultInjector::new(DeterministicRng::new(seed))),
        )
    }

    /// Physical capacity.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated_bytes
    }

    /// Number of live buffers.
    #[must_use]
    pub fn buffers_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Whether `ptr` is a live allocation.
    #[must_use]
    pub fn is_allocated(&self, ptr: DevicePtr) -> bool {
        self.state.lock().buffers.contains_key(&ptr)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SimDeviceStats {
        self.state.lock().stats
    }

    /// The shared fault injector.
    #[must_use]
    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Kernel-style write straight into a buffer (no fault injection).
    ///
    /// # Errors
    /// Fails if the buffer is unknown or too small for `block`.
    pub fn write(&self, ptr: DevicePtr, block: HostBlock) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&ptr)
            .ok_or(BackendError::InvalidPointer { ptr })?;
        Self::check_fits(ptr, buffer, &block)?;
        buffer.contents = Some(block);
        Ok(())
    }

    /// Kernel-style read of a buffer's contents.
    ///
    /// # Errors
    /// Fails if the buffer is unknown.
    pub fn read(&self, ptr: DevicePtr) -> Result<Option<HostBlock>, BackendError> {
        let state = self.state.lock();
        state
            .buffers
            .get(&ptr)
            .map(|buffer| buffer.contents.clone())
            .ok_or(BackendError::InvalidPointer { ptr })
    }

    fn check_fits(ptr: DevicePtr, buffer: &SimBuffer, block: &HostBlock) -> Result<(), BackendError> {
        let required_bytes = block.size_bytes();
        if required_bytes > buffer.bytes {
            return Err(BackendError::BufferTooSmall {
                ptr,
                buffer_bytes: buffer.bytes,
                required_bytes,
            });
        }
        Ok(())
    }
}

impl DeviceBackend for SimDevice {
    fn alloc(&self, bytes: usize) -> Result<DevicePtr, BackendError> {
        let mut state = self.state.lock();
        let free_bytes = self.capacity_bytes.saturating_sub(state.allocated_bytes);

        match self.faults.should_inject(OP_DEVICE_ALLOC) {
            Some(FaultType::DeviceOutOfMemory) => {
                return Err(BackendError::OutOfMemory {
                    requested_bytes: bytes,
                    free_bytes,
                })
            }
            Some(fault) => return Err(BackendError::simulated(fault.as_str())),
            None => {}
        }

        if bytes > free_bytes {
            return Err(BackendError::OutOfMemory {
                requested_bytes: bytes,
                free_bytes,
            });
        }

        let ptr = DevicePtr(state.next_address);
        let span = (bytes.max(1) as u64).div_ceil(SIM_DEVICE_ALIGNMENT_BYTES)
            * SIM_DEVICE_ALIGNMENT_BYTES;
        state.next_address += span;
        state.buffers.insert(
            ptr,
            SimBuffer {
                bytes,
                contents: None,
            },
        );
        state.allocated_bytes += bytes;
        state.stats.allocs += 1;

        // Postcondition
        assert!(
            state.allocated_bytes <= self.capacity_bytes,
            "simulated device over-allocated"
        );

        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        let mut state = self.state.lock();
        match state.buffers.remove(&ptr) {
            Some(buffer) => {
                state.allocated_bytes -= buffer.bytes;
                state.stats.frees += 1;
            }
            None => {
                state.stats.invalid_frees += 1;
                tracing::warn!(%ptr, "free of unknown device pointer");
            }
        }
    }

    fn copy_host_to_device(&self, ptr: DevicePtr, block: &HostBlock) -> Result<(), BackendError> {
        if let Some(fault) = self.faults.should_inject(OP_COPY_HOST_TO_DEVICE) {
            return Err(BackendError::simulated(fault.as_str()));
        }

        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&ptr)
            .ok_or(BackendError::InvalidPointer { ptr })?;
        Self::check_fits(ptr, buffer, block)?;
        buffer.contents = Some(block.clone());
        state.stats.host_to_device_copies += 1;
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        ptr: DevicePtr,
        representation: Representation,
        shape: MatrixShape,
    ) -> Result<HostBlock, BackendError> {
        if let Some(fault) = self.faults.should_inject(OP_COPY_DEVICE_TO_HOST) {
            return Err(BackendError::simulated(fault.as_str()));
        }

        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get(&ptr)
            .ok_or(BackendError::InvalidPointer { ptr })?;

        let block = match &buffer.contents {
            Some(block) if block.representation() != representation => {
                return Err(BackendError::RepresentationMismatch {
                    ptr,
                    expected: representation,
                    actual: block.representation(),
                })
            }
            Some(block) => block.clone(),
            // Never written: device memory reads back as zeros.
            None => HostBlock::zeros(shape, representation),
        };
        state.stats.device_to_host_copies += 1;
        Ok(block)
    }
}
