//! Configuration for the interrupt, DMA, and lifecycle subsystems.
//!
//! Parsed from TOML. Every section and every key is optional; missing
//! values fall back to the defaults below.
//!
//! ```toml
//! [irq]
//! deferred-workers = 2
//! coalesce-interval-us = 1000
//!
//! [dma]
//! memory-size = 16777216
//! cache-line-size = 64
//! coherent = false
//!
//! [lifecycle]
//! quiesce-timeout-ms = 100
//! ```

use core::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors from loading a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(String),
    /// The TOML text did not parse or had the wrong shape.
    Parse(String),
    /// A value parsed but is out of range.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "failed to read config: {msg}"),
            Self::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            Self::Invalid(what) => write!(f, "invalid config value: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `[irq]` section.
    pub irq: IrqConfig,
    /// `[dma]` section.
    pub dma: DmaConfig,
    /// `[lifecycle]` section.
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.irq.deferred_workers == 0 {
            return Err(ConfigError::Invalid("irq.deferred-workers must be at least 1"));
        }
        if !self.dma.cache_line_size.is_power_of_two() {
            return Err(ConfigError::Invalid("dma.cache-line-size must be a power of two"));
        }
        if !self.dma.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("dma.page-size must be a power of two"));
        }
        if self.dma.mask_bits == 0 || self.dma.mask_bits > 64 {
            return Err(ConfigError::Invalid("dma.mask-bits must be in 1..=64"));
        }
        if self.dma.memory_size == 0 {
            return Err(ConfigError::Invalid("dma.memory-size must be non-zero"));
        }
        Ok(())
    }
}

/// `[irq]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct IrqConfig {
    /// Number of threads servicing deferred handlers registered without a
    /// dedicated thread.
    pub deferred_workers: usize,
    /// Coalescing interval applied to registrations that do not set one.
    /// `None` disables coalescing by default.
    pub coalesce_interval_us: Option<u64>,
}

impl IrqConfig {
    /// Returns the default coalescing interval as a [`Duration`].
    #[must_use]
    pub fn default_coalesce_interval(&self) -> Option<Duration> {
        self.coalesce_interval_us.map(Duration::from_micros)
    }
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self {
            deferred_workers: 2,
            coalesce_interval_us: None,
        }
    }
}

/// `[dma]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DmaConfig {
    /// Bus address of the first byte of system memory.
    pub memory_base: u64,
    /// Size of system memory available to DMA allocations.
    pub memory_size: u64,
    /// CPU cache line size in bytes.
    pub cache_line_size: usize,
    /// Allocation granule for coherent buffers and mappings.
    pub page_size: u64,
    /// `true` if the interconnect keeps CPU caches coherent with devices,
    /// making explicit sync operations no-ops.
    pub coherent: bool,
    /// Number of address bits a device can drive.
    pub mask_bits: u32,
}

impl DmaConfig {
    /// Returns the DMA mask derived from [`mask_bits`](Self::mask_bits).
    #[must_use]
    pub fn mask(&self) -> u64 {
        if self.mask_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.mask_bits) - 1
        }
    }
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            memory_base: 0x8000_0000,
            memory_size: 16 * 1024 * 1024,
            cache_line_size: 64,
            page_size: 4096,
            coherent: false,
            mask_bits: 32,
        }
    }
}

/// `[lifecycle]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct LifecycleConfig {
    /// How long suspend waits for outstanding DMA completions before
    /// cancelling them.
    pub quiesce_timeout_ms: u64,
}

impl LifecycleConfig {
    /// Returns the quiesce timeout as a [`Duration`].
    #[must_use]
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            quiesce_timeout_ms: 100,
        }
    }
}
