//! # devmem
//!
//! Device memory manager for linear-algebra operands on a single accelerator.
//!
//! ## Features
//!
//! - **Residency tracking**: each host matrix gets a device mirror with an
//!   explicit clean/dirty state machine
//! - **Lock-safe eviction**: LRU, LFU or min-evict victim selection that never
//!   touches an object with outstanding acquisitions
//! - **Write-back**: dirty device copies are copied home before their buffer
//!   is released
//! - **Buffer reuse**: released buffers are parked in an exact-size free pool
//!   and drained oldest-first under pressure
//! - **Deterministic testing**: a simulated device with seeded fault
//!   injection
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use devmem::{DeviceConfig, DeviceContext, EvictionPolicyKind, HostBlock, HostMatrix};
//!
//! # fn main() -> Result<(), devmem::DeviceError> {
//! let config = DeviceConfig::default()
//!     .with_capacity_bytes(256)
//!     .with_eviction_policy(EvictionPolicyKind::Lru);
//! let (ctx, _device) = DeviceContext::sim(config)?;
//!
//! let a = ctx.attach(Arc::new(HostMatrix::new(1, HostBlock::filled(4, 4, 1.0))))?;
//! let b = ctx.attach(Arc::new(HostMatrix::new(2, HostBlock::filled(4, 4, 2.0))))?;
//!
//! ctx.acquire_read(&a)?;
//! ctx.release_input(&a)?;
//! ctx.acquire_read(&b)?;
//! ctx.release_input(&b)?;
//! assert_eq!(ctx.used_bytes(), 256);
//!
//! // A third operand forces the least recently used one out.
//! let c = ctx.attach(Arc::new(HostMatrix::new(3, HostBlock::filled(4, 4, 3.0))))?;
//! ctx.acquire_read(&c)?;
//! assert!(!ctx.is_live(a.id()));
//! ctx.release_input(&c)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      DeviceContext                       │
//! │  acquire / release / clear / destroy / ensure_capacity   │
//! ├──────────────────┬───────────────────┬───────────────────┤
//! │  LiveRegistry    │  EvictionEngine   │  FreeBufferPool   │
//! │  resident objs   │  LRU / LFU / Min  │  exact-size LIFO  │
//! ├──────────────────┴───────────────────┴───────────────────┤
//! │  DeviceBackend (trait)  ──  SimDevice + FaultInjector    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Size estimation and the simulation harness live in `devmem-core` and are
//! re-exported here.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod context;
pub mod device;
pub mod error;
pub mod eviction;
pub mod host;
pub mod object;
pub mod pool;
pub mod registry;
pub mod stats;
pub mod telemetry;

// Re-export common types
pub use constants::*;
pub use devmem_core::dst;
pub use devmem_core::{
    estimate_size_bytes, run_property_tests, test_seeds, DeterministicRng, FaultConfig,
    FaultInjector, FaultInjectorBuilder, FaultType, MatrixShape, PropertyTest,
    PropertyTestFailure, PropertyTestResult, PropertyTestable, Representation, SimConfig,
};

pub use config::{ConfigError, DeviceConfig, EvictionPolicyKind};
pub use context::{DeviceContext, ShutdownReport};
pub use device::{BackendError, DeviceBackend, DevicePtr, SimDevice, SimDeviceStats, TransferDirection};
pub use error::{DeviceError, DeviceResult};
pub use eviction::{
    policy_for, EvictionCandidate, EvictionEngine, EvictionPolicy, LfuPolicy, LruPolicy,
    MinEvictPolicy,
};
pub use host::{CsrBlock, HostBlock, HostMatrix, MatrixId};
pub use object::{DeviceObject, ObjectState};
pub use pool::FreeBufferPool;
pub use registry::LiveRegistry;
pub use stats::{DeviceStats, DeviceStatsSnapshot};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError};
