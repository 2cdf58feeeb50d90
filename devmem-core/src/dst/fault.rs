//! FaultInjector - Probabilistic Fault Injection
//!
//! TigerStyle: Explicit fault injection for chaos testing of the device
//! primitives (allocation and host/device copies).

use std::collections::HashMap;

use parking_lot::Mutex;

use super::rng::DeterministicRng;
use crate::constants::DST_FAULT_PROBABILITY_MAX;

/// Operation name checked before a device allocation.
pub const OP_DEVICE_ALLOC: &str = "device_alloc";
/// Operation name checked before a host-to-device copy.
pub const OP_COPY_HOST_TO_DEVICE: &str = "device_copy_h2d";
/// Operation name checked before a device-to-host copy.
pub const OP_COPY_DEVICE_TO_HOST: &str = "device_copy_d2h";

/// Types of faults that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// Allocator reports the device is out of memory
    DeviceOutOfMemory,
    /// Allocator fails for a reason other than capacity
    DeviceAllocFail,
    /// Host-to-device copy fails
    HostToDeviceCopyFail,
    /// Device-to-host copy fails (write-back or host read)
    DeviceToHostCopyFail,
}

impl FaultType {
    /// Get the fault type name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceOutOfMemory => "device_out_of_memory",
            Self::DeviceAllocFail => "device_alloc_fail",
            Self::HostToDeviceCopyFail => "host_to_device_copy_fail",
            Self::DeviceToHostCopyFail => "device_to_host_copy_fail",
        }
    }

    /// The operation this fault naturally applies to.
    #[must_use]
    pub fn default_operation(&self) -> &'static str {
        match self {
            Self::DeviceOutOfMemory | Self::DeviceAllocFail => OP_DEVICE_ALLOC,
            Self::HostToDeviceCopyFail => OP_COPY_HOST_TO_DEVICE,
            Self::DeviceToHostCopyFail => OP_COPY_DEVICE_TO_HOST,
        }
    }
}

/// Configuration for a specific fault.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// The type of fault
    pub fault_type: FaultType,
    /// Probability of injection (0.0 to 1.0)
    pub probability: f64,
    /// Operation filter (substring match). Defaults to the fault's own operation.
    pub operation_filter: Option<String>,
    /// Maximum number of injections (None = unlimited)
    pub max_injections: Option<u64>,
    /// Number of matching calls to let through before the fault can fire
    pub skip_first: u64,
}

impl FaultConfig {
    /// Create a new fault configuration scoped to the fault's own operation.
    ///
    /// # Panics
    /// Panics if probability is not in [0, 1].
    #[must_use]
    pub fn new(fault_type: FaultType, probability: f64) -> Self {
        assert!(
            (0.0..=DST_FAULT_PROBABILITY_MAX).contains(&probability),
            "probability must be in [0, {}], got {}",
            DST_FAULT_PROBABILITY_MAX,
            probability
        );

        Self {
            fault_type,
            probability,
            operation_filter: Some(fault_type.default_operation().to_string()),
            max_injections: None,
            skip_first: 0,
        }
    }

    /// Override the operation filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.operation_filter = Some(filter.into());
        self
    }

    /// Apply to every operation.
    #[must_use]
    pub fn any_operation(mut self) -> Self {
        self.operation_filter = None;
        self
    }

    /// Set maximum number of injections.
    ///
    /// # Panics
    /// Panics if `max` is zero.
    #[must_use]
    pub fn with_max_injections(mut self, max: u64) -> Self {
        assert!(max > 0, "max_injections must be positive");
        self.max_injections = Some(max);
        self
    }

    /// Let the first `count` matching calls succeed.
    #[must_use]
    pub fn after(mut self, count: u64) -> Self {
        self.skip_first = count;
        self
    }

    fn matches(&self, operation: &str) -> bool {
        self.operation_filter
            .as_deref()
            .map_or(true, |filter| operation.contains(filter))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ConfigCounters {
    seen: u64,
    injected: u64,
}

/// Fault injector for simulation testing.
///
/// Interior-mutable so one injector can be shared via `Arc` between a
/// simulated device and the test harness.
#[derive(Debug)]
pub struct FaultInjector {
    rng: Mutex<DeterministicRng>,
    configs: Vec<FaultConfig>,
    counters: Mutex<Vec<ConfigCounters>>,
}

impl FaultInjector {
    /// Create a new fault injector with the given RNG.
    #[must_use]
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            configs: Vec::new(),
            counters: Mutex::new(Vec::new()),
        }
    }

    /// An injector that never fires.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(DeterministicRng::new(0))
    }

    /// Register a fault configuration.
    ///
    /// Registration must happen before sharing via `Arc`.
    pub fn register(&mut self, config: FaultConfig) {
        self.configs.push(config);
        self.counters.lock().push(ConfigCounters::default());
    }

    /// Check if a fault should be injected for the given operation.
    ///
    /// Returns the first registered fault that matches and wins its roll.
    pub fn should_inject(&self, operation: &str) -> Option<FaultType> {
        let mut counters = self.counters.lock();

        for (config, counter) in self.configs.iter().zip(counters.iter_mut()) {
            if !config.matches(operation) {
                continue;
            }

            counter.seen += 1;
            if counter.seen <= config.skip_first {
                continue;
            }
            if config
                .max_injections
                .is_some_and(|max| counter.injected >= max)
            {
                continue;
            }

            if self.rng.lock().next_bool(config.probability) {
                counter.injected += 1;
                tracing::debug!(
                    operation,
                    fault = config.fault_type.as_str(),
                    "DST: injecting fault"
                );
                return Some(config.fault_type);
            }
        }

        None
    }

    /// Injection counts keyed by fault name.
    #[must_use]
    pub fn injection_stats(&self) -> HashMap<String, u64> {
        let counters = self.counters.lock();
        let mut stats: HashMap<String, u64> = HashMap::new();
        for (config, counter) in self.configs.iter().zip(counters.iter()) {
            *stats
                .entry(config.fault_type.as_str().to_string())
                .or_default() += counter.injected;
        }
        stats
    }

    /// Get total number of injections.
    #[must_use]
    pub fn total_injections(&self) -> u64 {
        self.counters.lock().iter().map(|c| c.injected).sum()
    }

    /// Reset all counters (skip windows start over).
    pub fn reset_stats(&self) {
        for counter in self.counters.lock().iter_mut() {
            *counter = ConfigCounters::default();
        }
    }
}

/// Builder for `FaultInjector`.
pub struct FaultInjectorBuilder {
    rng: DeterministicRng,
    configs: Vec<FaultConfig>,
}

impl FaultInjectorBuilder {
    /// Create a new builder with the given RNG.
    #[must_use]
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng,
            configs: Vec::new(),
        }
    }

    /// Add a fault configuration.
    #[must_use]
    pub fn with_fault(mut self, config: FaultConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Add allocator faults (out-of-memory and generic failure).
    #[must_use]
    pub fn with_alloc_faults(self, probability: f64) -> Self {
        self.with_fault(FaultConfig::new(FaultType::DeviceOutOfMemory, probability))
            .with_fault(FaultConfig::new(FaultType::DeviceAllocFail, probability))
    }

    /// Add copy faults in both directions.
    #[must_use]
    pub fn with_copy_faults(self, probability: f64) -> Self {
        self.with_fault(FaultConfig::new(FaultType::HostToDeviceCopyFail, probability))
            .with_fault(FaultConfig::new(FaultType::DeviceToHostCopyFail, probability))
    }

    /// Build the FaultInjector.
    #[must_use]
    pub fn build(self) -> FaultInjector {
        let mut injector = FaultInjector::new(self.rng);
        for config in self.configs {
            injector.register(config);
        }
        injector
    }
}
