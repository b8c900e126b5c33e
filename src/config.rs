//! Manager configuration
//!
//! Defaults, environment overrides (`LEDGERLOCK_*`), validation and a
//! builder for programmatic setup.

use crate::error::{Error, Result};
use crate::transaction::types::{AcquisitionOrder, DetectionStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 2] = ["json", "pretty"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on each blocking lock acquisition
    #[serde(with = "duration_ms")]
    pub acquisition_timeout: Duration,

    /// Context slot bound, used only by the transitive-closure strategy
    pub max_concurrent_contexts: Option<usize>,

    /// How often a blocked acquisition re-reads the holder and re-probes
    #[serde(with = "duration_ms")]
    pub holder_recheck_interval: Duration,

    pub detection_strategy: DetectionStrategy,

    pub acquisition_order: AcquisitionOrder,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            acquisition_timeout: Duration::from_secs(1),
            max_concurrent_contexts: None,
            holder_recheck_interval: Duration::from_millis(10),
            detection_strategy: DetectionStrategy::IncrementalDfs,
            acquisition_order: AcquisitionOrder::Declared,
            logging: LoggingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `LEDGERLOCK_*` overrides without validating, so callers can
    /// layer further settings on top first.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(ms) = std::env::var("LEDGERLOCK_ACQUIRE_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| Error::ConfigError("Invalid LEDGERLOCK_ACQUIRE_TIMEOUT_MS".to_string()))?;
            self.acquisition_timeout = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("LEDGERLOCK_MAX_CONTEXTS") {
            self.max_concurrent_contexts = Some(
                max.parse()
                    .map_err(|_| Error::ConfigError("Invalid LEDGERLOCK_MAX_CONTEXTS".to_string()))?,
            );
        }
        if let Ok(ms) = std::env::var("LEDGERLOCK_RECHECK_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| Error::ConfigError("Invalid LEDGERLOCK_RECHECK_MS".to_string()))?;
            self.holder_recheck_interval = Duration::from_millis(ms);
        }
        if let Ok(strategy) = std::env::var("LEDGERLOCK_STRATEGY") {
            self.detection_strategy = strategy.parse()?;
        }
        if let Ok(order) = std::env::var("LEDGERLOCK_ORDER") {
            self.acquisition_order = order.parse()?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(level) = std::env::var("LEDGERLOCK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LEDGERLOCK_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.holder_recheck_interval.is_zero() {
            return Err(Error::ConfigError(
                "holder_recheck_interval must be positive".to_string(),
            ));
        }

        match (self.detection_strategy, self.max_concurrent_contexts) {
            (_, Some(0)) => {
                return Err(Error::ConfigError(
                    "max_concurrent_contexts must be positive".to_string(),
                ))
            }
            (DetectionStrategy::TransitiveClosure, None) => {
                return Err(Error::ConfigError(
                    "transitive_closure requires max_concurrent_contexts".to_string(),
                ))
            }
            // A single slot cannot hold both ends of an edge.
            (DetectionStrategy::TransitiveClosure, Some(1)) => {
                return Err(Error::ConfigError(
                    "max_concurrent_contexts must be at least 2".to_string(),
                ))
            }
            _ => {}
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::ConfigError(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(Error::ConfigError(format!(
                "Invalid log format: {}. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }

        Ok(())
    }
}

/// Configuration builder for programmatic setup
pub struct ConfigBuilder {
    config: ManagerConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquisition_timeout = timeout;
        self
    }

    pub fn with_strategy(mut self, strategy: DetectionStrategy) -> Self {
        self.config.detection_strategy = strategy;
        self
    }

    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.config.max_concurrent_contexts = Some(max);
        self
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.config.holder_recheck_interval = interval;
        self
    }

    pub fn with_order(mut self, order: AcquisitionOrder) -> Self {
        self.config.acquisition_order = order;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Result<ManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
