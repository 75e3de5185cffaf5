//! # Engine Configuration
//!
//! Unified configuration for the replication engine, loaded once at startup
//! and passed down explicitly. This module provides:
//! - Serde-deserializable config structs with documented defaults
//! - JSON config file loading
//! - Validation with precise error reporting
//!
//! Every field falls back to its default when absent, so a minimal config
//! only needs `sourceRoots`, `targets` and `storePath`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    /// Config file could not be parsed
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// One named replication destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Target identifier, unique across the engine
    pub id: String,

    /// Destination root the target's files live under
    pub base_path: PathBuf,

    /// Per-target copy semaphore capacity; falls back to
    /// `concurrency.perTargetMax` when absent
    #[serde(default)]
    pub max_concurrent_copies: Option<usize>,
}

/// Stability detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StabilityConfig {
    /// Seconds between size/mtime samples
    pub interval_seconds: u64,

    /// Consecutive unchanged samples required before a file is stable
    pub required_samples: u32,

    /// Minimum age in seconds between first sighting and enqueueing
    pub min_age_seconds: u64,

    /// Seconds an inaccessible candidate may linger before it is dropped
    pub inaccessible_deadline_seconds: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            required_samples: 2,
            min_age_seconds: 5,
            inaccessible_deadline_seconds: 300,
        }
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Upper bound for the adaptive controller's global copy limit
    pub global_max: usize,

    /// Default per-target semaphore capacity
    pub per_target_max: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_max: 8,
            per_target_max: 2,
        }
    }
}

/// Retry and backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Per-target attempt cap; reaching it makes the target permanent-failed
    pub max_attempts: u32,

    /// Base delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Delay ceiling, in milliseconds
    pub max_delay_ms: u64,

    /// Exponential multiplier applied per attempt
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay, in [0, 1)
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

/// Verification tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerifyConfig {
    /// Re-read and re-hash finalized files. Must be true in production;
    /// false skips the re-read and trusts the copy-time hash (development
    /// only).
    pub rehash: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self { rehash: true }
    }
}

/// Adaptive concurrency controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleConfig {
    /// Seconds between controller evaluations
    pub evaluation_interval_seconds: u64,

    /// p95 copy latency above this decrements the limit, in milliseconds
    pub latency_high_watermark_ms: u64,

    /// p95 copy latency below this permits an increment, in milliseconds
    pub latency_low_watermark_ms: u64,

    /// Process memory above this decrements the limit, in bytes
    pub memory_high_watermark_bytes: u64,

    /// Estimated disk IOPS above this blocks increments
    pub iops_high_watermark: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 30,
            latency_high_watermark_ms: 120_000,
            latency_low_watermark_ms: 30_000,
            memory_high_watermark_bytes: 2 * 1024 * 1024 * 1024,
            iops_high_watermark: 5_000.0,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Allowlisted source directories, read-only to the engine
    pub source_roots: Vec<PathBuf>,

    /// Replication destinations
    pub targets: Vec<TargetConfig>,

    /// Include globs for candidate files
    pub file_patterns: Vec<String>,

    /// Stability detector tuning
    pub stability: StabilityConfig,

    /// Concurrency limits
    pub concurrency: ConcurrencyConfig,

    /// Retry and backoff tuning
    pub retry: RetryConfig,

    /// Verification tuning
    pub verify: VerifyConfig,

    /// Adaptive controller tuning
    pub throttle: ThrottleConfig,

    /// Path to the embedded database file
    pub store_path: PathBuf,

    /// I/O and hashing chunk size, in bytes
    pub chunk_bytes: usize,

    /// Seconds between full rescans of the source roots
    pub rescan_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_roots: Vec::new(),
            targets: Vec::new(),
            file_patterns: vec![
                "*.dcm".to_string(),
                "*.dicom".to_string(),
                "*.nii".to_string(),
                "*.nii.gz".to_string(),
                "*.mha".to_string(),
                "*.bin".to_string(),
            ],
            stability: StabilityConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            throttle: ThrottleConfig::default(),
            store_path: PathBuf::from("forker.db"),
            chunk_bytes: crate::hashing::DEFAULT_CHUNK_BYTES,
            rescan_interval_seconds: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.source_roots.is_empty() {
            return Err(ConfigError::Invalid("sourceRoots must not be empty".into()));
        }
        if self.targets.len() < 2 {
            return Err(ConfigError::Invalid(
                "at least two targets are required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if target.id.is_empty() {
                return Err(ConfigError::Invalid("target id must not be empty".into()));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target id: {}",
                    target.id
                )));
            }
        }
        if self.concurrency.global_max == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.globalMax must be at least 1".into(),
            ));
        }
        if self.concurrency.per_target_max == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.perTargetMax must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.maxAttempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be >= 1.0 so delays stay non-decreasing".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::Invalid(
                "retry.jitterFraction must be in [0, 1)".into(),
            ));
        }
        if self.chunk_bytes == 0 {
            return Err(ConfigError::Invalid("chunkBytes must be positive".into()));
        }
        if self.stability.required_samples == 0 {
            return Err(ConfigError::Invalid(
                "stability.requiredSamples must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Per-target copy limit, falling back to the global per-target default
    pub fn per_target_limit(&self, target_id: &str) -> usize {
        self.targets
            .iter()
            .find(|t| t.id == target_id)
            .and_then(|t| t.max_concurrent_copies)
            .unwrap_or(self.concurrency.per_target_max)
    }
}
