//! Device Backend Trait - Allocation and Copy Primitives
//!
//! `TigerStyle`: Simulation-first device abstraction.
//!
//! # Architecture
//!
//! ```text
//! DeviceBackend (trait)
//! └── SimDevice   (always available, in-memory, fault-injectable)
//! ```
//!
//! The manager owns every buffer it obtains from a backend; a `DevicePtr` is a
//! plain non-owning handle and is only meaningful while the manager has it
//! bound to an object or parked in the free pool.

mod sim;

pub use sim::{SimDevice, SimDeviceStats};

use std::fmt;

use serde::{Deserialize, Serialize};

use devmem_core::{MatrixShape, Representation};

use crate::host::HostBlock;

// =============================================================================
// Handles
// =============================================================================

/// Raw device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Direction of a host/device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Host memory into a device buffer
    HostToDevice,
    /// Device buffer back into host memory
    DeviceToHost,
}

impl TransferDirection {
    /// Get the direction name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostToDevice => "host_to_device",
            Self::DeviceToHost => "device_to_host",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Failures reported by device primitives.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Allocator has no room for the request
    #[error("device allocator out of memory: requested {requested_bytes} bytes, {free_bytes} free")]
    OutOfMemory {
        /// Bytes requested
        requested_bytes: usize,
        /// Bytes the allocator reports free
        free_bytes: usize,
    },

    /// Pointer is not a live allocation
    #[error("invalid device pointer {ptr}")]
    InvalidPointer {
        /// Offending pointer
        ptr: DevicePtr,
    },

    /// Buffer cannot hold the data being copied into it
    #[error("buffer {ptr} holds {buffer_bytes} bytes, {required_bytes} required")]
    BufferTooSmall {
        /// Destination buffer
        ptr: DevicePtr,
        /// Buffer size
        buffer_bytes: usize,
        /// Bytes needed
        required_bytes: usize,
    },

    /// Buffer contents are in a different layout than requested
    #[error("buffer {ptr} holds {actual} data, {expected} requested")]
    RepresentationMismatch {
        /// Source buffer
        ptr: DevicePtr,
        /// Requested layout
        expected: Representation,
        /// Stored layout
        actual: Representation,
    },

    /// Simulated fault (for DST)
    #[error("simulated fault: {fault}")]
    SimulatedFault {
        /// Fault name
        fault: String,
    },
}

impl BackendError {
    /// Create a simulated fault error.
    #[must_use]
    pub fn simulated(fault: impl Into<String>) -> Self {
        Self::SimulatedFault {
            fault: fault.into(),
        }
    }

    /// Check if this is an out-of-memory report.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

// =============================================================================
// DeviceBackend Trait
// =============================================================================

/// Allocate/free and host/device copy primitives of one accelerator.
///
/// Implementations need not be reentrant-safe for allocation: the manager
/// serialises every `alloc` and `free` under its context lock. Copies may be
/// issued while other threads run kernels on unrelated buffers.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Allocate `bytes` of device memory.
    ///
    /// # Errors
    /// `OutOfMemory` when the allocator cannot satisfy the request, or any
    /// other backend failure.
    fn alloc(&self, bytes: usize) -> Result<DevicePtr, BackendError>;

    /// Return a buffer to the allocator.
    ///
    /// Freeing a pointer the backend does not know is a caller bug; backends
    /// log and ignore it.
    fn free(&self, ptr: DevicePtr);

    /// Copy host contents into a device buffer.
    ///
    /// # Errors
    /// Fails if the buffer is unknown or too small, or the copy faults.
    fn copy_host_to_device(&self, ptr: DevicePtr, block: &HostBlock) -> Result<(), BackendError>;

    /// Copy a device buffer back to host memory in the given layout.
    ///
    /// # Errors
    /// Fails if the buffer is unknown, holds another layout, or the copy faults.
    fn copy_device_to_host(
        &self,
        ptr: DevicePtr,
        representation: Representation,
        shape: MatrixShape,
    ) -> Result<HostBlock, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_display() {
        assert_eq!(DevicePtr(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn test_backend_error_messages() {
        let err = BackendError::OutOfMemory {
            requested_bytes: 64,
            free_bytes: 8,
        };
        assert!(err.is_out_of_memory());
        assert!(err.to_string().contains("requested 64 bytes"));

        let err = BackendError::simulated("device_to_host_copy_fail");
        assert!(!err.is_out_of_memory());
        assert_eq!(err.to_string(), "simulated fault: device_to_host_copy_fail");
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(TransferDirection::HostToDevice.to_string(), "host_to_device");
        assert_eq!(TransferDirection::DeviceToHost.as_str(), "device_to_host");
    }
}
