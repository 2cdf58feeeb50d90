//! `TigerStyle` Constants
//!
//! Manager-level names and defaults. Footprint and capacity limits live in
//! `devmem_core::constants` and are re-exported here.
//!
//! All limits use big-endian naming: `CATEGORY_SPECIFICS_UNIT_LIMIT`

pub use devmem_core::constants::*;

// =============================================================================
// Configuration Environment
// =============================================================================

/// Device capacity override (bytes)
pub const CONFIG_CAPACITY_BYTES_ENV: &str = "DEVMEM_CAPACITY_BYTES";

/// Eviction policy selection (`lru | lfu | min_evict`)
pub const CONFIG_EVICTION_POLICY_ENV: &str = "DEVMEM_EVICTION_POLICY";

/// Whether released buffers are pooled (`true | false | 1 | 0`)
pub const CONFIG_POOL_ENABLED_ENV: &str = "DEVMEM_POOL_ENABLED";

/// Upper bound on pooled bytes
pub const CONFIG_POOL_BYTES_MAX_ENV: &str = "DEVMEM_POOL_BYTES_MAX";

// =============================================================================
// Telemetry
// =============================================================================

/// Log filter directive variable
pub const TELEMETRY_FILTER_ENV: &str = "DEVMEM_LOG";

/// ANSI colour toggle variable
pub const TELEMETRY_ANSI_ENV: &str = "DEVMEM_LOG_ANSI";

/// Filter used when none is configured
pub const TELEMETRY_FILTER_DEFAULT: &str = "info";

// =============================================================================
// Simulated Device
// =============================================================================

/// Alignment of simulated device pointers
pub const SIM_DEVICE_ALIGNMENT_BYTES: u64 = 256;

/// First pointer a simulated device hands out
pub const SIM_DEVICE_BASE_ADDRESS: u64 = 0x1000_0000;

// =============================================================================
// Device Context
// =============================================================================

/// Attach-table size below which dead entries are not swept
pub const CONTEXT_ATTACHED_SWEEP_COUNT_MIN: usize = 64;
