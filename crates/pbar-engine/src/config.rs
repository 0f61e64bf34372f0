//! Configuration for the telemetry engine.
//!
//! Supports loading from a TOML file with environment variable overrides.
//! Every tunable named in the component contracts is defined here with its
//! documented default.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::RetryPolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Logging level for the embedding process.
    pub log_level: String,

    /// Trace intake tunables.
    pub intake: IntakeConfig,

    /// Sampling policy tunables.
    pub sampling: SamplingConfig,

    /// Predictor engine tunables.
    pub predictor: PredictorConfig,

    /// Subscription fabric tunables.
    pub fabric: FabricConfig,

    /// Retry budget for transient store failures.
    pub retry: RetryPolicy,
}

/// Trace intake state machine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Compare-and-set attempts before surfacing a conflict.
    pub cas_retry_limit: u32,

    /// TTL refreshed on in-flight trace/step hashes per mutation (seconds).
    pub inflight_ttl_seconds: f64,

    /// TTL applied to hot-state entries once a trace completes, so late
    /// readers can still snapshot it (seconds).
    pub completion_grace_seconds: f64,

    /// A trace whose last update is older than this is aborted (seconds).
    pub idle_expiry_seconds: f64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            cas_retry_limit: 3,
            inflight_ttl_seconds: 86_400.0,
            completion_grace_seconds: 300.0,
            idle_expiry_seconds: 3_600.0,
        }
    }
}

/// Sampling policy tunables.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Seed for the retention draw. Fixed seeds make retention decisions
    /// reproducible; `None` seeds from entropy at startup.
    pub draw_seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { draw_seed: None }
    }
}

/// Predictor engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Minimum spacing between recomputes of a stale cell (seconds).
    /// Coalesces retention bursts into one durable scan.
    pub recompute_min_interval_seconds: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            recompute_min_interval_seconds: 30.0,
        }
    }
}

/// Subscription fabric tunables.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Per-subscriber queue capacity; overflow drops the oldest message and
    /// marks the subscription lagged.
    pub queue_capacity: usize,

    /// Idle readers are torn down after this long without a poll (seconds).
    pub idle_timeout_seconds: u64,
}

impl FabricConfig {
    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            idle_timeout_seconds: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            intake: IntakeConfig::default(),
            sampling: SamplingConfig::default(),
            predictor: PredictorConfig::default(),
            fabric: FabricConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PBAR_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(seed) = std::env::var("PBAR_SAMPLING_SEED") {
            if let Ok(seed) = seed.parse() {
                self.sampling.draw_seed = Some(seed);
            }
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.intake.cas_retry_limit == 0 {
            bail!("cas_retry_limit must be at least 1");
        }
        if self.intake.completion_grace_seconds < 0.0 {
            bail!("completion_grace_seconds must be non-negative");
        }
        if self.intake.idle_expiry_seconds <= 0.0 {
            bail!("idle_expiry_seconds must be positive");
        }
        if self.predictor.recompute_min_interval_seconds < 0.0 {
            bail!("recompute_min_interval_seconds must be non-negative");
        }
        if self.fabric.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    intake: IntakeConfig,
    #[serde(default)]
    sampling: SamplingConfig,
    #[serde(default)]
    predictor: PredictorConfig,
    #[serde(default)]
    fabric: FabricConfig,
    #[serde(default)]
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl From<TomlConfig> for EngineConfig {
    fn from(file: TomlConfig) -> Self {
        Self {
            log_level: file.general.log_level,
            intake: file.intake,
            sampling: file.sampling,
            predictor: file.predictor,
            fabric: file.fabric,
            retry: file.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.intake.cas_retry_limit, 3);
        assert_eq!(config.intake.completion_grace_seconds, 300.0);
        assert_eq!(config.intake.idle_expiry_seconds, 3_600.0);
        assert_eq!(config.fabric.queue_capacity, 16);
        assert_eq!(config.fabric.idle_timeout_seconds, 30);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn toml_overrides_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [general]
            log_level = "debug"

            [intake]
            cas_retry_limit = 5
            idle_expiry_seconds = 120.0

            [sampling]
            draw_seed = 42

            [fabric]
            queue_capacity = 4

            [retry]
            max_attempts = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.intake.cas_retry_limit, 5);
        assert_eq!(config.intake.idle_expiry_seconds, 120.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.intake.completion_grace_seconds, 300.0);
        assert_eq!(config.sampling.draw_seed, Some(42));
        assert_eq!(config.fabric.queue_capacity, 4);
        assert_eq!(config.retry.max_attempts, 6);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.intake.cas_retry_limit = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fabric.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.intake.idle_expiry_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(EngineConfig::from_toml_str("[intake\ncas_retry_limit = 1").is_err());
    }
}
