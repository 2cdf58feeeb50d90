//! DST - Deterministic Simulation Testing
//!
//! TigerBeetle/FoundationDB-style harness for the device memory manager:
//! a seeded RNG, probabilistic fault injection for device allocation and
//! copies, and a property-test runner.
//!
//! # Usage
//!
//! ```rust
//! use devmem_core::dst::{DeterministicRng, FaultConfig, FaultInjectorBuilder, FaultType};
//!
//! let injector = FaultInjectorBuilder::new(DeterministicRng::new(42))
//!     .with_fault(FaultConfig::new(FaultType::DeviceToHostCopyFail, 1.0).with_max_injections(1))
//!     .build();
//!
//! assert!(injector.should_inject("device_copy_d2h").is_some());
//! assert!(injector.should_inject("device_copy_d2h").is_none());
//! ```
//!
//! Run with explicit seed for reproducibility:
//! ```bash
//! DST_SEED=12345 cargo test
//! ```

mod config;
mod fault;
mod property;
mod rng;

pub use config::{SimConfig, DST_SEED_ENV};
pub use fault::{
    FaultConfig, FaultInjector, FaultInjectorBuilder, FaultType, OP_COPY_DEVICE_TO_HOST,
    OP_COPY_HOST_TO_DEVICE, OP_DEVICE_ALLOC,
};
pub use property::{
    run_property_tests, test_seeds, PropertyTest, PropertyTestFailure, PropertyTestResult,
    PropertyTestable,
};
pub use rng::DeterministicRng;
