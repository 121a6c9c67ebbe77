//! Engine configuration.
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! processor = "auto"
//! max_general_concurrency = 5
//! stripe_pixel_threshold = 1000000
//!
//! [memory]
//! limit_bytes = 536870912
//! warning_ratio = 0.75
//! critical_ratio = 0.9
//! ```

use crate::core::error::{EngineError, EngineResult};
use crate::core::types::ProcessorPreference;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MB: usize = 1024 * 1024;

/// Default memory limit (500 MB)
pub const DEFAULT_MEMORY_LIMIT: usize = 500 * MB;

/// Default stripe size for the general backend, in pixels.
pub const DEFAULT_STRIPE_PIXELS: u64 = 1_000_000;

/// Default stripe size for the accelerated backend, in pixels.
pub const DEFAULT_ACCELERATED_STRIPE_PIXELS: u64 = 4_000_000;

/// Default ceiling on persisted output size, in pixels.
pub const DEFAULT_OUTPUT_PIXEL_CEILING: u64 = 800_000_000;

/// Memory budget read by the memory guard before each admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudget {
    /// Hard ceiling in bytes.
    pub limit_bytes: usize,
    /// Usage ratio at which the guard enters the Warning state.
    pub warning_ratio: f32,
    /// Usage ratio at which admissions trigger reclamation.
    pub critical_ratio: f32,
    /// Reuse float stripe buffers between tasks.
    pub pooling_enabled: bool,
    /// Shrink stripes while memory is under pressure.
    pub compression_enabled: bool,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            limit_bytes: DEFAULT_MEMORY_LIMIT,
            warning_ratio: 0.75,
            critical_ratio: 0.90,
            pooling_enabled: true,
            compression_enabled: true,
        }
    }
}

impl MemoryBudget {
    /// Create a budget with default ratios.
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            ..Self::default()
        }
    }

    /// Set the memory limit in bytes.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit_bytes = limit;
        self
    }

    /// Set the memory limit in megabytes.
    pub fn with_limit_mb(mut self, mb: usize) -> Self {
        self.limit_bytes = mb * MB;
        self
    }

    /// Set the warning and critical ratios.
    pub fn with_ratios(mut self, warning: f32, critical: f32) -> Self {
        self.warning_ratio = warning;
        self.critical_ratio = critical;
        self
    }

    /// Enable or disable buffer pooling.
    pub fn with_pooling(mut self, enabled: bool) -> Self {
        self.pooling_enabled = enabled;
        self
    }

    /// Enable or disable stripe shrinking under pressure.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Bytes at which the Warning state begins.
    pub fn warning_bytes(&self) -> usize {
        (self.limit_bytes as f64 * self.warning_ratio as f64).round() as usize
    }

    /// Bytes at which the Critical state begins.
    pub fn critical_bytes(&self) -> usize {
        (self.limit_bytes as f64 * self.critical_ratio as f64).round() as usize
    }

    /// Pick a budget profile for the memory currently available to the process.
    pub fn recommended(available_bytes: usize) -> Self {
        if available_bytes < 50 * MB {
            Self {
                limit_bytes: 32 * MB,
                warning_ratio: 0.6,
                critical_ratio: 0.7,
                pooling_enabled: true,
                compression_enabled: true,
            }
        } else if available_bytes < 100 * MB {
            Self {
                limit_bytes: 64 * MB,
                warning_ratio: 0.7,
                critical_ratio: 0.8,
                pooling_enabled: true,
                compression_enabled: true,
            }
        } else {
            Self {
                limit_bytes: (available_bytes / 2).min(256 * MB),
                warning_ratio: 0.75,
                critical_ratio: 0.85,
                pooling_enabled: true,
                compression_enabled: false,
            }
        }
    }

    /// Reject inconsistent budgets.
    pub fn validate(&self) -> EngineResult<()> {
        if self.limit_bytes == 0 {
            return Err(EngineError::Config("memory limit must be positive".to_string()));
        }
        let ratio_ok = |r: f32| r.is_finite() && r > 0.0 && r <= 1.0;
        if !ratio_ok(self.warning_ratio) || !ratio_ok(self.critical_ratio) {
            return Err(EngineError::Config(format!(
                "memory ratios must be within (0, 1], got {} / {}",
                self.warning_ratio, self.critical_ratio
            )));
        }
        if self.warning_ratio > self.critical_ratio {
            return Err(EngineError::Config(
                "warning ratio must not exceed critical ratio".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for an [`Engine`](crate::execution::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Memory budget.
    pub memory: MemoryBudget,
    /// Default backend preference.
    pub processor: ProcessorPreference,
    /// Worker count of the general path.
    pub max_general_concurrency: usize,
    /// Stripe size on the general backend.
    pub stripe_pixel_threshold: u64,
    /// Stripe size on the accelerated backend.
    pub accelerated_stripe_pixel_threshold: u64,
    /// Largest output persisted without downscaling.
    pub output_pixel_ceiling: u64,
    /// Probe for an accelerator at startup.
    pub enable_accelerator: bool,
    /// Run the background memory monitor.
    pub enable_monitor: bool,
    /// Monitor period while memory is Normal.
    pub monitor_interval_ms: u64,
    /// Monitor period while memory is Warning or Critical.
    pub monitor_fast_interval_ms: u64,
    /// Minimum time between two reclamation passes.
    pub reclaim_interval_ms: u64,
    /// Settle time after a reclamation pass.
    pub reclaim_settle_ms: u64,
    /// Number of parsed tables kept by path.
    pub lut_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory: MemoryBudget::default(),
            processor: ProcessorPreference::Auto,
            max_general_concurrency: 5,
            stripe_pixel_threshold: DEFAULT_STRIPE_PIXELS,
            accelerated_stripe_pixel_threshold: DEFAULT_ACCELERATED_STRIPE_PIXELS,
            output_pixel_ceiling: DEFAULT_OUTPUT_PIXEL_CEILING,
            enable_accelerator: true,
            enable_monitor: true,
            monitor_interval_ms: 5000,
            monitor_fast_interval_ms: 1000,
            reclaim_interval_ms: 2000,
            reclaim_settle_ms: 100,
            lut_cache_capacity: 5,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Set the memory budget.
    pub fn with_memory(mut self, memory: MemoryBudget) -> Self {
        self.memory = memory;
        self
    }

    /// Set the default processor preference.
    pub fn with_processor(mut self, processor: ProcessorPreference) -> Self {
        self.processor = processor;
        self
    }

    /// Set the number of general workers.
    pub fn with_general_concurrency(mut self, workers: usize) -> Self {
        self.max_general_concurrency = workers;
        self
    }

    /// Set the general stripe threshold in pixels.
    pub fn with_stripe_threshold(mut self, pixels: u64) -> Self {
        self.stripe_pixel_threshold = pixels;
        self
    }

    /// Set the output pixel ceiling.
    pub fn with_output_ceiling(mut self, pixels: u64) -> Self {
        self.output_pixel_ceiling = pixels;
        self
    }

    /// Enable or disable the accelerator probe.
    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.enable_accelerator = enabled;
        self
    }

    /// Enable or disable the background memory monitor.
    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.enable_monitor = enabled;
        self
    }

    /// Set the reclamation rate limit and settle time.
    pub fn with_reclaim_timing(mut self, interval_ms: u64, settle_ms: u64) -> Self {
        self.reclaim_interval_ms = interval_ms;
        self.reclaim_settle_ms = settle_ms;
        self
    }

    /// Monitor period while memory is Normal.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Monitor period under pressure.
    pub fn monitor_fast_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_fast_interval_ms)
    }

    /// Reject inconsistent configurations.
    pub fn validate(&self) -> EngineResult<()> {
        self.memory.validate()?;
        if self.max_general_concurrency == 0 {
            return Err(EngineError::Config(
                "max_general_concurrency must be at least 1".to_string(),
            ));
        }
        if self.stripe_pixel_threshold == 0 || self.accelerated_stripe_pixel_threshold == 0 {
            return Err(EngineError::Config("stripe thresholds must be positive".to_string()));
        }
        if self.output_pixel_ceiling == 0 {
            return Err(EngineError::Config("output ceiling must be positive".to_string()));
        }
        if self.lut_cache_capacity == 0 {
            return Err(EngineError::Config("lut_cache_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_general_concurrency, 5);
        assert_eq!(config.stripe_pixel_threshold, 1_000_000);
        assert_eq!(config.output_pixel_ceiling, 800_000_000);
        assert_eq!(config.memory.warning_ratio, 0.75);
        assert_eq!(config.memory.critical_ratio, 0.90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            processor = "cpu"
            stripe_pixel_threshold = 5000

            [memory]
            limit_bytes = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.processor, ProcessorPreference::Cpu);
        assert_eq!(config.stripe_pixel_threshold, 5000);
        assert_eq!(config.memory.limit_bytes, 1024 * 1024);
        assert_eq!(config.memory.critical_ratio, 0.90);
        assert_eq!(config.max_general_concurrency, 5);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("max_general_concurrency = 0").unwrap_err();
        assert_eq!(err.kind(), "config");
        let err = EngineConfig::from_toml_str("processor = 3").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::new()
            .with_stripe_threshold(1234)
            .with_memory(MemoryBudget::new(10 * MB).with_compression(false));
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "enable_monitor = false\n").unwrap();
        assert!(!EngineConfig::load(&path).unwrap().enable_monitor);
    }

    #[test]
    fn test_recommended_profiles() {
        let low = MemoryBudget::recommended(40 * MB);
        assert_eq!(low.limit_bytes, 32 * MB);
        assert!(low.compression_enabled);

        let medium = MemoryBudget::recommended(80 * MB);
        assert_eq!(medium.limit_bytes, 64 * MB);

        let high = MemoryBudget::recommended(4096 * MB);
        assert_eq!(high.limit_bytes, 256 * MB);
        assert!(!high.compression_enabled);
        assert!(high.validate().is_ok());
    }

    #[test]
    fn test_budget_thresholds() {
        let budget = MemoryBudget::new(1000);
        assert_eq!(budget.warning_bytes(), 750);
        assert_eq!(budget.critical_bytes(), 900);
        assert!(MemoryBudget::new(1000).with_ratios(0.95, 0.9).validate().is_err());
    }
}
