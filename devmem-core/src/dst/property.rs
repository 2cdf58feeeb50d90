//! Property-Based Testing for DST
//!
//! TigerStyle: Random operation sequences with invariant checking.
//!
//! A `PropertyTestable` model generates operations from the current state,
//! applies them, and reports invariant violations. The runner replays
//! exactly from its seed, so a failure message is a complete reproduction.
//!
//! # Example
//!
//! ```rust
//! use devmem_core::dst::{DeterministicRng, PropertyTest, PropertyTestable};
//!
//! struct Budget { used: usize, capacity: usize }
//!
//! #[derive(Debug, Clone)]
//! enum BudgetOp { Take(usize), Give(usize) }
//!
//! impl PropertyTestable for Budget {
//!     type Operation = BudgetOp;
//!
//!     fn generate_operation(&self, rng: &mut DeterministicRng) -> BudgetOp {
//!         if rng.next_bool(0.5) {
//!             BudgetOp::Take(rng.next_usize(0, self.capacity - self.used))
//!         } else {
//!             BudgetOp::Give(rng.next_usize(0, self.used))
//!         }
//!     }
//!
//!     fn apply_operation(&mut self, op: &BudgetOp) {
//!         match op {
//!             BudgetOp::Take(n) => self.used += n,
//!             BudgetOp::Give(n) => self.used -= n,
//!         }
//!     }
//!
//!     fn check_invariants(&self) -> Result<(), String> {
//!         if self.used > self.capacity {
//!             return Err(format!("used {} above capacity {}", self.used, self.capacity));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let result = PropertyTest::new(42)
//!     .with_max_operations(500)
//!     .run(Budget { used: 0, capacity: 64 });
//! assert!(result.is_success());
//! ```

use std::fmt::Debug;

use super::rng::DeterministicRng;
use crate::constants::{
    DST_PROPERTY_OPERATIONS_COUNT_DEFAULT, DST_SEEDS_DEFAULT, DST_SIMULATION_STEPS_MAX,
};

/// Trait for systems that can be property-tested.
pub trait PropertyTestable {
    /// The type of operations that can be performed.
    type Operation: Debug + Clone;

    /// Generate a random operation based on current state.
    fn generate_operation(&self, rng: &mut DeterministicRng) -> Self::Operation;

    /// Apply an operation to the state.
    ///
    /// Expected failures (out of memory, injected faults) are part of the
    /// model and must not panic; record them and let invariants judge.
    fn apply_operation(&mut self, op: &Self::Operation);

    /// Check that all invariants hold.
    fn check_invariants(&self) -> Result<(), String>;

    /// Describe the current state for failure reports.
    fn describe_state(&self) -> String {
        String::from("(state description not implemented)")
    }
}

/// Result of a property test run.
#[derive(Debug)]
pub struct PropertyTestResult {
    /// Number of operations successfully executed
    pub operations_executed: u64,
    /// Seed used for reproduction
    pub seed: u64,
    /// Failure details, if any
    pub failure: Option<PropertyTestFailure>,
}

impl PropertyTestResult {
    /// Check if the test passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Check if the test failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Unwrap the result, panicking with details if failed.
    ///
    /// # Panics
    /// Panics if the test failed, with reproduction info.
    pub fn unwrap(self) {
        if let Some(failure) = self.failure {
            panic!(
                "Property test failed!\n\
                 Seed: {} (use this to reproduce)\n\
                 Operation #{}: {}\n\
                 Invariant violation: {}\n\
                 State: {}",
                self.seed,
                failure.operation_index,
                failure.operation,
                failure.message,
                failure.state_description
            );
        }
    }
}

/// Details of a property test failure.
#[derive(Debug)]
pub struct PropertyTestFailure {
    /// Index of the failing operation (0-based)
    pub operation_index: u64,
    /// The operation that caused the failure
    pub operation: String,
    /// The invariant violation message
    pub message: String,
    /// Description of the state at failure
    pub state_description: String,
}

/// Property-based test runner.
#[derive(Debug)]
pub struct PropertyTest {
    seed: u64,
    max_operations: u64,
    check_invariants_before: bool,
}

impl PropertyTest {
    /// Create a new property test with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_operations: DST_PROPERTY_OPERATIONS_COUNT_DEFAULT,
            check_invariants_before: true,
        }
    }

    /// Set the maximum number of operations to run.
    ///
    /// # Panics
    /// Panics if max exceeds DST_SIMULATION_STEPS_MAX.
    #[must_use]
    pub fn with_max_operations(mut self, max: u64) -> Self {
        assert!(
            max <= DST_SIMULATION_STEPS_MAX,
            "max_operations {} exceeds DST_SIMULATION_STEPS_MAX {}",
            max,
            DST_SIMULATION_STEPS_MAX
        );
        self.max_operations = max;
        self
    }

    /// Disable checking invariants before the first operation.
    #[must_use]
    pub fn skip_initial_invariant_check(mut self) -> Self {
        self.check_invariants_before = false;
        self
    }

    /// Run the property test.
    #[must_use]
    pub fn run<T: PropertyTestable>(self, mut state: T) -> PropertyTestResult {
        let mut rng = DeterministicRng::new(self.seed);

        if self.check_invariants_before {
            if let Err(msg) = state.check_invariants() {
                return PropertyTestResult {
                    operations_executed: 0,
                    seed: self.seed,
                    failure: Some(PropertyTestFailure {
                        operation_index: 0,
                        operation: "(initial state)".to_string(),
                        message: format!("Initial state violates invariants: {}", msg),
                        state_description: state.describe_state(),
                    }),
                };
            }
        }

        for i in 0..self.max_operations {
            let op = state.generate_operation(&mut rng);
            let op_debug = format!("{:?}", op);
            state.apply_operation(&op);

            if let Err(msg) = state.check_invariants() {
                return PropertyTestResult {
                    operations_executed: i + 1,
                    seed: self.seed,
                    failure: Some(PropertyTestFailure {
                        operation_index: i,
                        operation: op_debug,
                        message: msg,
                        state_description: state.describe_state(),
                    }),
                };
            }
        }

        PropertyTestResult {
            operations_executed: self.max_operations,
            seed: self.seed,
            failure: None,
        }
    }

    /// Run the property test, panicking on failure.
    ///
    /// # Panics
    /// Panics if any invariant is violated.
    pub fn run_and_assert<T: PropertyTestable>(self, state: T) {
        self.run(state).unwrap();
    }
}

/// Run one property test per seed, building fresh state for each.
///
/// The factory receives the seed so the model can seed its own
/// simulated device from it.
///
/// # Panics
/// Panics if any test fails.
pub fn run_property_tests<T, F>(seeds: &[u64], max_operations: u64, state_factory: F)
where
    T: PropertyTestable,
    F: Fn(u64) -> T,
{
    for &seed in seeds {
        let state = state_factory(seed);
        PropertyTest::new(seed)
            .with_max_operations(max_operations)
            .run_and_assert(state);
    }
}

/// Seeds for a multi-seed suite: the fixed defaults, then derived extras.
///
/// Deterministic for a given `count`.
///
/// # Panics
/// Panics if `count` is zero.
#[must_use]
pub fn test_seeds(count: usize) -> Vec<u64> {
    assert!(count > 0, "need at least one seed");

    let mut seeds: Vec<u64> = DST_SEEDS_DEFAULT.iter().copied().take(count).collect();
    let mut rng = DeterministicRng::new(DST_SEEDS_DEFAULT[DST_SEEDS_DEFAULT.len() - 1]);
    while seeds.len() < count {
        seeds.push(rng.next_u64());
    }
    seeds
}
