//! TigerStyle Constants
//!
//! All limits use big-endian naming: CATEGORY_SPECIFICS_UNIT_LIMIT
//! Example: DEVICE_CAPACITY_BYTES_DEFAULT (not DEFAULT_DEVICE_CAPACITY)
//!
//! Every constant includes units in the name:
//! - _BYTES for sizes, _BYTES_MAX/MIN for size limits
//! - _COUNT_MAX for quantity limits

// =============================================================================
// Element Footprints
// =============================================================================

/// Bytes per dense element (IEEE-754 double)
pub const DENSE_ELEMENT_BYTES: usize = 8;

/// Bytes per sparse nonzero value (IEEE-754 double)
pub const SPARSE_VALUE_BYTES: usize = 8;

/// Bytes per sparse column index
pub const SPARSE_COLUMN_INDEX_BYTES: usize = 4;

/// Bytes per sparse row pointer entry
pub const SPARSE_ROW_POINTER_BYTES: usize = 4;

/// Bytes charged per sparse nonzero (value + column index)
pub const SPARSE_NONZERO_BYTES: usize = SPARSE_VALUE_BYTES + SPARSE_COLUMN_INDEX_BYTES;

// =============================================================================
// Device Capacity
// =============================================================================

/// Default device capacity when none is configured
pub const DEVICE_CAPACITY_BYTES_DEFAULT: usize = 2 * 1024 * 1024 * 1024; // 2GB

/// Smallest capacity a device context accepts
pub const DEVICE_CAPACITY_BYTES_MIN: usize = 1;

/// Largest capacity a device context accepts
#[cfg(target_pointer_width = "64")]
pub const DEVICE_CAPACITY_BYTES_MAX: usize = 1 << 48; // 256TB

/// Largest capacity a device context accepts (whole address space)
#[cfg(not(target_pointer_width = "64"))]
pub const DEVICE_CAPACITY_BYTES_MAX: usize = usize::MAX;

// =============================================================================
// Free Buffer Pool
// =============================================================================

/// Default upper bound on bytes parked in the free buffer pool
pub const POOL_BYTES_MAX_DEFAULT: usize = usize::MAX;

/// Maximum buffers parked in a single size bucket
pub const POOL_BUCKET_BUFFERS_COUNT_MAX: usize = 1024;

// =============================================================================
// Eviction
// =============================================================================

/// Maximum live objects considered in one eviction round
pub const EVICTION_CANDIDATES_COUNT_MAX: usize = 1_000_000;

// =============================================================================
// DST (Deterministic Simulation Testing) Limits
// =============================================================================

/// Maximum number of simulation steps
pub const DST_SIMULATION_STEPS_MAX: u64 = 1_000_000;

/// Maximum probability for fault injection (1.0 = 100%)
pub const DST_FAULT_PROBABILITY_MAX: f64 = 1.0;

/// Default number of operations per property test run
pub const DST_PROPERTY_OPERATIONS_COUNT_DEFAULT: u64 = 100;

/// Seeds every multi-seed DST suite runs with
pub const DST_SEEDS_DEFAULT: [u64; 8] = [0, 1, 7, 42, 1337, 9001, 123_456, u64::MAX];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_footprint_consistent() {
        assert_eq!(SPARSE_NONZERO_BYTES, 12);
        assert_eq!(SPARSE_ROW_POINTER_BYTES, 4);
        assert_eq!(DENSE_ELEMENT_BYTES, std::mem::size_of::<f64>());
    }

    #[test]
    fn test_capacity_limits_valid() {
        assert!(DEVICE_CAPACITY_BYTES_MIN < DEVICE_CAPACITY_BYTES_DEFAULT);
        assert!(DEVICE_CAPACITY_BYTES_DEFAULT < DEVICE_CAPACITY_BYTES_MAX);
    }

    #[test]
    fn test_capacity_max_fits_pointer_width() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(DEVICE_CAPACITY_BYTES_MAX as u64, 1u64 << 48);
        #[cfg(not(target_pointer_width = "64"))]
        assert_eq!(DEVICE_CAPACITY_BYTES_MAX, usize::MAX);

        assert!(u64::try_from(DEVICE_CAPACITY_BYTES_MAX).is_ok());
    }
}
