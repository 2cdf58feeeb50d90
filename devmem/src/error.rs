//! Device Manager Errors
//!
//! `TigerStyle`: Explicit error types with context. Every failure reaches the
//! caller of the triggering operation; nothing is retried or swallowed here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::device::{BackendError, TransferDirection};
use crate::host::MatrixId;

/// Errors from device memory operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Not enough memory even after draining the pool and evicting every
    /// unlocked object. Nothing was evicted.
    #[error(
        "device out of memory: requested {requested_bytes} bytes, \
         {available_bytes} available, {reclaimable_bytes} reclaimable"
    )]
    DeviceOutOfMemory {
        /// Bytes requested
        requested_bytes: usize,
        /// Bytes free at the time of the request
        available_bytes: usize,
        /// Bytes the pool and unlocked objects could have given back
        reclaimable_bytes: usize,
    },

    /// Release without a matching acquisition.
    #[error("invalid lock state on {id}: {operation} with no outstanding lock")]
    InvalidLockState {
        /// Object released
        id: MatrixId,
        /// Operation that found no lock
        operation: &'static str,
    },

    /// Write-back of a dirty victim failed; the victim stays resident and dirty.
    #[error("write-back of {id} during eviction failed")]
    EvictionWriteBackFailure {
        /// Victim whose contents could not be saved
        id: MatrixId,
        /// Underlying copy failure
        #[source]
        source: BackendError,
    },

    /// Host/device copy failed outside eviction.
    #[error("{direction} transfer of {id} failed")]
    Transfer {
        /// Object being copied
        id: MatrixId,
        /// Copy direction
        direction: TransferDirection,
        /// Underlying copy failure
        #[source]
        source: BackendError,
    },

    /// Allocator failure other than running out of memory.
    #[error("device allocation of {requested_bytes} bytes failed")]
    Allocation {
        /// Bytes requested
        requested_bytes: usize,
        /// Underlying allocator failure
        #[source]
        source: BackendError,
    },

    /// Operation needs an unlocked object.
    #[error("{id} is in use ({lock_count} outstanding locks)")]
    ObjectInUse {
        /// Locked object
        id: MatrixId,
        /// Locks held at the time
        lock_count: u32,
    },

    /// Object was destroyed.
    #[error("{id} has been freed")]
    ObjectFreed {
        /// Destroyed object
        id: MatrixId,
    },

    /// Read-acquire of a matrix that has no host contents.
    #[error("{id} has no host data to transfer")]
    HostDataMissing {
        /// Matrix without contents
        id: MatrixId,
    },

    /// Another live object already mirrors this matrix.
    #[error("{id} is already attached to this context")]
    AlreadyAttached {
        /// Duplicate identity
        id: MatrixId,
    },

    /// Object handle was attached to a different context.
    #[error("{id} belongs to device context {owner}, not {context}")]
    ForeignObject {
        /// Object passed in
        id: MatrixId,
        /// Context that attached it
        owner: u64,
        /// Context it was passed to
        context: u64,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DeviceError {
    /// Create an out-of-memory error.
    #[must_use]
    pub fn out_of_memory(
        requested_bytes: usize,
        available_bytes: usize,
        reclaimable_bytes: usize,
    ) -> Self {
        Self::DeviceOutOfMemory {
            requested_bytes,
            available_bytes,
            reclaimable_bytes,
        }
    }

    /// Create an invalid lock state error.
    #[must_use]
    pub fn invalid_lock_state(id: MatrixId, operation: &'static str) -> Self {
        Self::InvalidLockState { id, operation }
    }

    /// Check if this is a capacity failure (caller may fall back to host execution).
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::DeviceOutOfMemory { .. })
    }

    /// Check if this signals a caller bug or lost data rather than a
    /// runtime condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidLockState { .. }
                | Self::EvictionWriteBackFailure { .. }
                | Self::ObjectFreed { .. }
                | Self::AlreadyAttached { .. }
                | Self::ForeignObject { .. }
        )
    }

    /// The object involved, if any.
    #[must_use]
    pub fn matrix_id(&self) -> Option<MatrixId> {
        match self {
            Self::InvalidLockState { id, .. }
            | Self::EvictionWriteBackFailure { id, .. }
            | Self::Transfer { id, .. }
            | Self::ObjectInUse { id, .. }
            | Self::ObjectFreed { id }
            | Self::HostDataMissing { id }
            | Self::AlreadyAttached { id }
            | Self::ForeignObject { id, .. } => Some(*id),
            Self::DeviceOutOfMemory { .. } | Self::Allocation { .. } | Self::Config(_) => None,
        }
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_out_of_memory() {
        let err = DeviceError::out_of_memory(300, 0, 0);
        assert!(err.is_out_of_memory());
        assert!(!err.is_fatal());
        assert_eq!(err.matrix_id(), None);
        assert!(err.to_string().contains("requested 300 bytes"));
    }

    #[test]
    fn test_write_back_failure_is_fatal_and_chained() {
        let err = DeviceError::EvictionWriteBackFailure {
            id: MatrixId(4),
            source: BackendError::simulated("device_to_host_copy_fail"),
        };
        assert!(err.is_fatal());
        assert_eq!(err.matrix_id(), Some(MatrixId(4)));
        assert_eq!(
            err.source().map(ToString::to_string),
            Some("simulated fault: device_to_host_copy_fail".to_string())
        );
    }

    #[test]
    fn test_invalid_lock_state_message() {
        let err = DeviceError::invalid_lock_state(MatrixId(2), "release_input");
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "invalid lock state on m2: release_input with no outstanding lock"
        );
    }

    #[test]
    fn test_transfer_message() {
        let err = DeviceError::Transfer {
            id: MatrixId(1),
            direction: TransferDirection::HostToDevice,
            source: BackendError::simulated("x"),
        };
        assert_eq!(err.to_string(), "host_to_device transfer of m1 failed");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_foreign_object_message() {
        let err = DeviceError::ForeignObject {
            id: MatrixId(3),
            owner: 1,
            context: 2,
        };
        assert!(err.is_fatal());
        assert_eq!(err.matrix_id(), Some(MatrixId(3)));
        assert_eq!(err.to_string(), "m3 belongs to device context 1, not 2");
    }
}
