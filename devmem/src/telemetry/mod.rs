//! Structured Logging Setup
//!
//! `TigerStyle`: Opt-in, never panics. The library only emits `tracing`
//! events; binaries and tests call [`init_telemetry`] once to see them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devmem::telemetry::{init_telemetry, TelemetryConfig};
//!
//! // Reads DEVMEM_LOG / DEVMEM_LOG_ANSI
//! init_telemetry(TelemetryConfig::default()).expect("telemetry init");
//!
//! // Or configure explicitly
//! let config = TelemetryConfig::builder()
//!     .filter("devmem=debug")
//!     .ansi(false)
//!     .build();
//! # let _ = config;
//! ```
//!
//! ## Environment Variables
//!
//! - `DEVMEM_LOG` - `EnvFilter` directives (default: "info")
//! - `DEVMEM_LOG_ANSI` - colour output, `0`/`false` to disable (default: on)

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::constants::{TELEMETRY_ANSI_ENV, TELEMETRY_FILTER_DEFAULT, TELEMETRY_FILTER_ENV};

/// Telemetry setup errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The filter directives did not parse
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter {
        /// The rejected directives
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber could not be installed
    #[error("telemetry initialization failed: {reason}")]
    InitFailed {
        /// The reason for the failure
        reason: String,
    },
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `"info,devmem=debug"`
    pub filter: String,

    /// Colour the output
    pub ansi: bool,

    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }
}

impl TelemetryConfig {
    /// Create a new builder for `TelemetryConfig`
    #[must_use]
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::default()
    }

    /// Build from an arbitrary variable lookup (the environment by default).
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup(TELEMETRY_FILTER_ENV)
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| TELEMETRY_FILTER_DEFAULT.to_string());
        let ansi = lookup(TELEMETRY_ANSI_ENV).map_or(true, |raw| {
            !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
        });

        Self {
            filter,
            ansi,
            with_target: true,
        }
    }

    /// Parse the filter directives.
    ///
    /// # Errors
    /// Returns `TelemetryError::InvalidFilter` if the directives are malformed.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Builder for `TelemetryConfig`
#[derive(Default)]
pub struct TelemetryConfigBuilder {
    filter: Option<String>,
    ansi: Option<bool>,
    with_target: Option<bool>,
}

impl TelemetryConfigBuilder {
    /// Set the filter directives
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Enable or disable colour
    #[must_use]
    pub fn ansi(mut self, ansi: bool) -> Self {
        self.ansi = Some(ansi);
        self
    }

    /// Include or omit event targets
    #[must_use]
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = Some(with_target);
        self
    }

    /// Build the `TelemetryConfig`
    #[must_use]
    pub fn build(self) -> TelemetryConfig {
        let default = TelemetryConfig::default();
        TelemetryConfig {
            filter: self.filter.unwrap_or(default.filter),
            ansi: self.ansi.unwrap_or(default.ansi),
            with_target: self.with_target.unwrap_or(default.with_target),
        }
    }
}

/// Install a global `fmt` subscriber.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidFilter` for malformed directives and
/// `TelemetryError::InitFailed` if a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let filter = config.env_filter()?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| TelemetryError::InitFailed {
            reason: e.to_string(),
        })?;

    tracing::debug!(filter = %config.filter, "telemetry initialized");
    Ok(())
}

/// Install a test-friendly subscriber, ignoring an existing one.
///
/// Output goes through the libtest capture so it only shows for failing
/// tests.
pub fn init_test_telemetry() {
    let filter = TelemetryConfig::from_lookup(|var| std::env::var(var).ok())
        .env_filter()
        .unwrap_or_else(|_| EnvFilter::new(TELEMETRY_FILTER_DEFAULT));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
