//! Configuration file support.
//!
//! Settings are read from `~/.idenhide/config.toml` and then `./.idenhiderc`,
//! later files overriding earlier ones. Every value is optional; accessors
//! resolve the effective value against the built-in defaults.

use crate::access::{DEFAULT_PRESIGN_TTL, MAX_PRESIGN_TTL};
use crate::dispatcher::{DEFAULT_CONCURRENCY, DEFAULT_ITEM_TIMEOUT, DispatcherConfig, normalize_concurrency};
use crate::layout::DEFAULT_OUTPUT_DIR;
use crate::retry::RetryPolicy;
use idenhide_abstraction::Strategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default detection service URL.
pub const DEFAULT_DETECTOR_URL: &str = "http://localhost:8000";

/// Default object-storage region.
pub const DEFAULT_REGION: &str = "ap-south-1";

/// Default detector request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdenhideConfig {
    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub detector: DetectorSection,

    #[serde(default)]
    pub storage: StorageSection,

    /// Log level
    #[serde(default)]
    pub log_level: Option<String>,
}

/// `[batch]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub item_timeout_secs: Option<u64>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

/// `[retry]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

/// `[detector]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub region: Option<String>,
    /// S3-compatible endpoint, e.g. a local MinIO.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root for local artifacts.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub presign_ttl_secs: Option<u64>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl IdenhideConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".idenhide")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".idenhiderc")
    }

    /// Discover and load configuration files.
    ///
    /// Loads configuration from:
    /// 1. Global config (~/.idenhide/config.toml)
    /// 2. Local config (./.idenhiderc)
    ///
    /// Local config overrides global config. Files that fail to parse are
    /// reported and skipped.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(found) => config.merge(&found),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Ignoring configuration file"),
            }
        }
        config
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        take(&mut self.batch.concurrency, &other.batch.concurrency);
        take(&mut self.batch.item_timeout_secs, &other.batch.item_timeout_secs);
        take(&mut self.batch.strategy, &other.batch.strategy);
        take(&mut self.retry.max_attempts, &other.retry.max_attempts);
        take(&mut self.retry.initial_delay_ms, &other.retry.initial_delay_ms);
        take(&mut self.retry.max_delay_ms, &other.retry.max_delay_ms);
        take(&mut self.retry.multiplier, &other.retry.multiplier);
        take(&mut self.detector.base_url, &other.detector.base_url);
        take(&mut self.detector.request_timeout_secs, &other.detector.request_timeout_secs);
        take(&mut self.storage.region, &other.storage.region);
        take(&mut self.storage.endpoint_url, &other.storage.endpoint_url);
        take(&mut self.storage.output_dir, &other.storage.output_dir);
        take(&mut self.storage.presign_ttl_secs, &other.storage.presign_ttl_secs);
        take(&mut self.log_level, &other.log_level);
    }

    /// Checks every value that is set.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch.concurrency == Some(0) {
            return Err(ConfigError::InvalidValue("batch.concurrency must be at least 1".to_string()));
        }
        if self.batch.item_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue("batch.item_timeout_secs must be > 0".to_string()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::InvalidValue("retry.max_attempts must be at least 1".to_string()));
        }
        if let Some(multiplier) = self.retry.multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::InvalidValue("retry.multiplier must be >= 1.0".to_string()));
            }
        }
        if let Some(ttl) = self.storage.presign_ttl_secs {
            if ttl == 0 || ttl > MAX_PRESIGN_TTL.as_secs() {
                return Err(ConfigError::InvalidValue(format!(
                    "storage.presign_ttl_secs must be between 1 and {}",
                    MAX_PRESIGN_TTL.as_secs()
                )));
            }
        }
        if let Some(url) = &self.detector.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue(format!("detector.base_url is not an http(s) URL: {url}")));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self.retry.initial_delay_ms.map_or(defaults.initial_delay, Duration::from_millis),
            max_delay: self.retry.max_delay_ms.map_or(defaults.max_delay, Duration::from_millis),
            multiplier: self.retry.multiplier.unwrap_or(defaults.multiplier),
        }
    }

    /// Effective dispatcher settings; concurrency is validated and clamped.
    pub fn dispatcher_config(&self) -> ConfigResult<DispatcherConfig> {
        let concurrency = normalize_concurrency(self.batch.concurrency.unwrap_or(DEFAULT_CONCURRENCY))
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(DispatcherConfig {
            concurrency,
            strategy: self.batch.strategy.unwrap_or_default(),
            item_timeout: self.batch.item_timeout_secs.map_or(DEFAULT_ITEM_TIMEOUT, Duration::from_secs),
            retry: self.retry_policy(),
        })
    }

    pub fn detector_url(&self) -> &str {
        self.detector.base_url.as_deref().unwrap_or(DEFAULT_DETECTOR_URL)
    }

    pub fn request_timeout(&self) -> Duration {
        self.detector.request_timeout_secs.map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
    }

    pub fn region(&self) -> &str {
        self.storage.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(self.storage.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR))
    }

    pub fn presign_ttl(&self) -> Duration {
        self.storage.presign_ttl_secs.map_or(DEFAULT_PRESIGN_TTL, Duration::from_secs)
    }
}
