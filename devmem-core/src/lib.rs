//! devmem Core - Footprints, Limits and DST
//!
//! TigerStyle simulation-first building blocks for the `devmem` device
//! memory manager, inspired by TigerBeetle/FoundationDB.
//!
//! # Philosophy
//!
//! > "If you're not testing with fault injection, you're not testing."
//!
//! 1. Build the test harness BEFORE the production code
//! 2. Every device primitive can fail under simulation
//! 3. Seeds are logged for reproducibility
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               devmem-core                    │
//! ├─────────────────────────────────────────────┤
//! │  constants   │ Footprints, capacity limits  │
//! │  estimate    │ Dense / sparse byte sizes    │
//! ├─────────────────────────────────────────────┤
//! │  dst         │ Seeded RNG, fault injection, │
//! │              │ property-test runner         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use devmem_core::{estimate_size_bytes, Representation};
//!
//! assert_eq!(estimate_size_bytes(10, 10, 100, Representation::Dense), 800);
//! assert_eq!(estimate_size_bytes(10, 1000, 5, Representation::Sparse), 100);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod dst;
pub mod estimate;

// Re-export common types
pub use constants::*;
pub use dst::{
    run_property_tests, test_seeds, DeterministicRng, FaultConfig, FaultInjector,
    FaultInjectorBuilder, FaultType, PropertyTest, PropertyTestFailure, PropertyTestResult,
    PropertyTestable, SimConfig,
};
pub use estimate::{estimate_size_bytes, MatrixShape, Representation};
