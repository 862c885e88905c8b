//! Configuration loading and merging.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. explicit path passed to [`HuginnConfig::load()`]
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//! 4. built-in defaults
//!
//! Every section and field is optional. Durations are written in
//! milliseconds with an `_ms` suffix:
//!
//! ```toml
//! [cache]
//! default_ttl_ms = 300000
//! max_items = 100
//! stale_while_revalidate_ms = 30000
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! retryable_kinds = ["connection", "timeout"]
//!
//! [monitor]
//! sampling_rate = 0.1
//! min_report_level = "critical"
//! ```
//!
//! Partial overrides are applied with [`HuginnConfig::merge()`], which
//! returns a new value and leaves both inputs untouched.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{ErrorKind, Severity};
use crate::monitor::MonitorConfig;
use crate::retry::RetryPolicy;
use crate::{HuginnError, Result};

/// Environment variable selecting [`Environment`] in [`Environment::detect()`].
pub const ENVIRONMENT_VAR: &str = "HUGINN_ENV";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuginnConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Policy for foreground fetches after a cache miss.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Policy for background refreshes of stale entries.
    #[serde(default = "RetryPolicy::for_revalidation")]
    pub revalidation: RetryPolicy,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for HuginnConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            revalidation: RetryPolicy::for_revalidation(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Deployment environment; selects environment-dependent defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Read [`ENVIRONMENT_VAR`]; `production`/`prod` select production,
    /// anything else development.
    pub fn detect() -> Self {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(value) => Self::parse(&value),
            Err(_) => Environment::Development,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    /// Default monitor sampling rate: 1.0 in development, 0.1 in production.
    pub fn default_sampling_rate(self) -> f64 {
        match self {
            Environment::Development => 1.0,
            Environment::Production => 0.1,
        }
    }
}

impl HuginnConfig {
    /// Defaults for the given environment.
    pub fn for_environment(env: Environment) -> Self {
        let mut config = Self::default();
        config.monitor.sampling_rate = env.default_sampling_rate();
        config
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HuginnError::Configuration(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, the first existing
    /// standard location is used, falling back to defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_file(&path),
            None => Ok(Self::default()),
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".huginn").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/huginn/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        let rate = self.monitor.sampling_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(HuginnError::Configuration(format!(
                "monitor.sampling_rate must be within [0, 1], got {rate}"
            )));
        }
        if self.cache.max_items == 0 {
            return Err(HuginnError::Configuration(
                "cache.max_items must be at least 1".to_string(),
            ));
        }
        let threshold = self.monitor.error_rate_threshold;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(HuginnError::Configuration(format!(
                "monitor.error_rate_threshold must be positive, got {}",
                self.monitor.error_rate_threshold
            )));
        }
        if self.monitor.max_correlations == 0 {
            return Err(HuginnError::Configuration(
                "monitor.max_correlations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `overrides` on top of `self`, returning a new config.
    pub fn merge(&self, overrides: &ConfigOverrides) -> Self {
        Self {
            cache: overrides.cache.apply(&self.cache),
            retry: overrides.retry.apply(&self.retry),
            revalidation: overrides.revalidation.apply(&self.revalidation),
            monitor: overrides.monitor.apply(&self.monitor),
        }
    }
}

/// A partial configuration; every `Some` field replaces the base value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub cache: CacheOverrides,
    pub retry: RetryOverrides,
    pub revalidation: RetryOverrides,
    pub monitor: MonitorOverrides,
}

impl ConfigOverrides {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HuginnError::Configuration(format!("Failed to parse overrides: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOverrides {
    pub enabled: Option<bool>,
    pub default_ttl_ms: Option<u64>,
    pub max_items: Option<usize>,
    pub stale_while_revalidate_ms: Option<u64>,
    pub debug: Option<bool>,
}

impl CacheOverrides {
    fn apply(&self, base: &CacheConfig) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            default_ttl: ms_or(self.default_ttl_ms, base.default_ttl),
            max_items: self.max_items.unwrap_or(base.max_items),
            stale_while_revalidate: ms_or(
                self.stale_while_revalidate_ms,
                base.stale_while_revalidate,
            ),
            debug: self.debug.unwrap_or(base.debug),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub retryable_kinds: Option<BTreeSet<ErrorKind>>,
    pub use_exponential_backoff: Option<bool>,
    pub jitter: Option<bool>,
}

impl RetryOverrides {
    fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay: ms_or(self.base_delay_ms, base.base_delay),
            max_delay: ms_or(self.max_delay_ms, base.max_delay),
            retryable_kinds: self
                .retryable_kinds
                .clone()
                .unwrap_or_else(|| base.retryable_kinds.clone()),
            use_exponential_backoff: self
                .use_exponential_backoff
                .unwrap_or(base.use_exponential_backoff),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOverrides {
    pub enabled: Option<bool>,
    pub sampling_rate: Option<f64>,
    pub error_rate_threshold: Option<f64>,
    pub min_report_level: Option<Severity>,
    pub disabled_kinds: Option<BTreeSet<ErrorKind>>,
    pub critical_kinds: Option<BTreeSet<ErrorKind>>,
    pub max_correlations: Option<usize>,
    pub max_correlation_age_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
}

impl MonitorOverrides {
    fn apply(&self, base: &MonitorConfig) -> MonitorConfig {
        MonitorConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            sampling_rate: self.sampling_rate.unwrap_or(base.sampling_rate),
            error_rate_threshold: self
                .error_rate_threshold
                .unwrap_or(base.error_rate_threshold),
            min_report_level: self.min_report_level.unwrap_or(base.min_report_level),
            disabled_kinds: self
                .disabled_kinds
                .clone()
                .unwrap_or_else(|| base.disabled_kinds.clone()),
            critical_kinds: self
                .critical_kinds
                .clone()
                .unwrap_or_else(|| base.critical_kinds.clone()),
            max_correlations: self.max_correlations.unwrap_or(base.max_correlations),
            max_correlation_age: ms_or(self.max_correlation_age_ms, base.max_correlation_age),
            sweep_interval: ms_or(self.sweep_interval_ms, base.sweep_interval),
        }
    }
}

fn ms_or(ms: Option<u64>, base: Duration) -> Duration {
    ms.map(Duration::from_millis).unwrap_or(base)
}

/// `Duration` as integer milliseconds, for `#[serde(with = "serde_ms")]`.
pub(crate) mod serde_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
