//! Device Configuration
//!
//! `TigerStyle`: Sensible defaults, builder pattern, explicit over implicit.
//!
//! The eviction policy is chosen once, when a context is built; it is not a
//! runtime-mutable flag.

use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    CONFIG_CAPACITY_BYTES_ENV, CONFIG_EVICTION_POLICY_ENV, CONFIG_POOL_BYTES_MAX_ENV,
    CONFIG_POOL_ENABLED_ENV, DEVICE_CAPACITY_BYTES_DEFAULT, DEVICE_CAPACITY_BYTES_MAX,
    DEVICE_CAPACITY_BYTES_MIN, POOL_BYTES_MAX_DEFAULT,
};

// =============================================================================
// Errors
// =============================================================================

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Capacity outside the supported range
    #[error("capacity_bytes {bytes} outside [{min}, {max}]")]
    InvalidCapacity {
        /// Rejected value
        bytes: usize,
        /// Smallest accepted capacity
        min: usize,
        /// Largest accepted capacity
        max: usize,
    },

    /// Environment variable holds an unparseable value
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// What was expected
        reason: String,
    },

    /// Unknown eviction policy name
    #[error("unknown eviction policy: {name} (expected lru, lfu or min_evict)")]
    UnknownPolicy {
        /// Rejected name
        name: String,
    },
}

// =============================================================================
// EvictionPolicyKind
// =============================================================================

/// Built-in eviction policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first
    Lfu,
    /// Best single fit, else largest first
    MinEvict,
}

impl EvictionPolicyKind {
    /// Get the policy name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::MinEvict => "min_evict",
        }
    }
}

impl fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "min_evict" | "minevict" => Ok(Self::MinEvict),
            _ => Err(ConfigError::UnknownPolicy {
                name: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// DeviceConfig
// =============================================================================

/// Configuration of one device context.
///
/// # Example
///
/// ```rust
/// use devmem::{DeviceConfig, EvictionPolicyKind};
///
/// let config = DeviceConfig::default()
///     .with_capacity_bytes(64 * 1024 * 1024)
///     .with_eviction_policy(EvictionPolicyKind::MinEvict)
///     .without_pool();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device memory the manager may hand out.
    ///
    /// Default: 2GB
    pub capacity_bytes: usize,

    /// Victim selection policy.
    ///
    /// Default: LRU
    pub eviction_policy: EvictionPolicyKind,

    /// Whether released buffers are kept for reuse.
    ///
    /// Default: true
    pub pool_enabled: bool,

    /// Upper bound on pooled bytes.
    ///
    /// Default: unbounded
    pub pool_bytes_max: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEVICE_CAPACITY_BYTES_DEFAULT,
            eviction_policy: EvictionPolicyKind::default(),
            pool_enabled: true,
            pool_bytes_max: POOL_BYTES_MAX_DEFAULT,
        }
    }
}

impl DeviceConfig {
    /// Create a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device capacity.
    #[must_use]
    pub fn with_capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Set the eviction policy.
    #[must_use]
    pub fn with_eviction_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Cap the pool at `bytes`.
    #[must_use]
    pub fn with_pool_bytes_max(mut self, bytes: usize) -> Self {
        self.pool_bytes_max = bytes;
        self
    }

    /// Free released buffers immediately instead of pooling them.
    #[must_use]
    pub fn without_pool(mut self) -> Self {
        self.pool_enabled = false;
        self
    }

    /// Effective pool cap (zero when pooling is off).
    #[must_use]
    pub fn effective_pool_bytes_max(&self) -> usize {
        if self.pool_enabled {
            self.pool_bytes_max
        } else {
            0
        }
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidCapacity` if the capacity is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(DEVICE_CAPACITY_BYTES_MIN..=DEVICE_CAPACITY_BYTES_MAX).contains(&self.capacity_bytes)
        {
            return Err(ConfigError::InvalidCapacity {
                bytes: self.capacity_bytes,
                min: DEVICE_CAPACITY_BYTES_MIN,
                max: DEVICE_CAPACITY_BYTES_MAX,
            });
        }
        Ok(())
    }

    /// Defaults overridden by `DEVMEM_*` environment variables.
    ///
    /// # Errors
    /// Fails if a variable is set to an unparseable value or the result does
    /// not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// # Errors
    /// Same as [`DeviceConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(CONFIG_CAPACITY_BYTES_ENV) {
            config.capacity_bytes = parse_env(CONFIG_CAPACITY_BYTES_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CONFIG_EVICTION_POLICY_ENV) {
            config.eviction_policy = raw.parse()?;
        }
        if let Some(raw) = lookup(CONFIG_POOL_ENABLED_ENV) {
            config.pool_enabled = parse_bool(CONFIG_POOL_ENABLED_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CONFIG_POOL_BYTES_MAX_ENV) {
            config.pool_bytes_max = parse_env(CONFIG_POOL_BYTES_MAX_ENV, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.capacity_bytes, DEVICE_CAPACITY_BYTES_DEFAULT);
        assert_eq!(config.eviction_policy, EvictionPolicyKind::Lru);
        assert!(config.pool_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new()
            .with_capacity_bytes(1000)
            .with_eviction_policy(EvictionPolicyKind::Lfu)
            .with_pool_bytes_max(100);
        assert_eq!(config.capacity_bytes, 1000);
        assert_eq!(config.eviction_policy, EvictionPolicyKind::Lfu);
        assert_eq!(config.effective_pool_bytes_max(), 100);
        assert_eq!(config.without_pool().effective_pool_bytes_max(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = DeviceConfig::default().with_capacity_bytes(0).validate();
        assert!(matches!(err, Err(ConfigError::InvalidCapacity { bytes: 0, .. })));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("LRU".parse::<EvictionPolicyKind>(), Ok(EvictionPolicyKind::Lru));
        assert_eq!(
            "min-evict".parse::<EvictionPolicyKind>(),
            Ok(EvictionPolicyKind::MinEvict)
        );
        assert_eq!(
            "min_evict".parse::<EvictionPolicyKind>(),
            Ok(EvictionPolicyKind::MinEvict)
        );
        assert!("fifo".parse::<EvictionPolicyKind>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = DeviceConfig::from_lookup(lookup(&[
            (CONFIG_CAPACITY_BYTES_ENV, "4096"),
            (CONFIG_EVICTION_POLICY_ENV, "lfu"),
            (CONFIG_POOL_ENABLED_ENV, "off"),
        ]))
        .unwrap();
        assert_eq!(config.capacity_bytes, 4096);
        assert_eq!(config.eviction_policy, EvictionPolicyKind::Lfu);
        assert!(!config.pool_enabled);
        assert_eq!(config.pool_bytes_max, POOL_BYTES_MAX_DEFAULT);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = DeviceConfig::from_lookup(lookup(&[(CONFIG_CAPACITY_BYTES_ENV, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == CONFIG_CAPACITY_BYTES_ENV));

        let err =
            DeviceConfig::from_lookup(lookup(&[(CONFIG_POOL_ENABLED_ENV, "maybe")])).unwrap_err();
        assert!(err.to_string().contains("expected a boolean"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"capacity_bytes": 1024, "eviction_policy": "min_evict"}"#)
                .unwrap();
        assert_eq!(config.capacity_bytes, 1024);
        assert_eq!(config.eviction_policy, EvictionPolicyKind::MinEvict);
        assert!(config.pool_enabled);
    }
}
