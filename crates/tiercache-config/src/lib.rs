//! Configuration for tiercache.
//!
//! [`TierCacheConfig`] is the serde tree read from `tiercache.toml` and
//! `TIERCACHE__*` environment variables (see [`loader`]). Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! prefix = "app"
//!
//! [defaults]
//! ttl_ms = 60000
//! early_expiration = 0.8
//!
//! [defaults.grace_period]
//! enabled = true
//! duration_ms = 3600000
//!
//! [redis]
//! enabled = true
//! url = "redis://cache:6379"
//!
//! [stores.sessions]
//! ttl_ms = 900000
//! ```

pub mod loader;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache_core::{
    CacheEntryOptions, EntryOptions, GracePeriod, LockTimeoutBehavior, Timeouts,
};
use tiercache_memory::MemoryConfig;
use tiercache_redis::RedisDriverConfig;

pub use loader::{load_config, load_config_from_path};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierCacheConfig {
    /// Key prefix applied to every store.
    pub prefix: String,
    /// Store returned by `CacheManager::default_store`.
    pub default_store: String,
    pub defaults: EntryDefaults,
    pub memory: MemorySection,
    pub redis: RedisSection,
    pub bus: BusSection,
    pub logging: LoggingSection,
    /// Per-store overrides of `defaults`.
    pub stores: BTreeMap<String, StoreOverrides>,
}

impl Default for TierCacheConfig {
    fn default() -> Self {
        Self {
            prefix: "tiercache".to_string(),
            default_store: "primary".to_string(),
            defaults: EntryDefaults::default(),
            memory: MemorySection::default(),
            redis: RedisSection::default(),
            bus: BusSection::default(),
            logging: LoggingSection::default(),
            stores: BTreeMap::new(),
        }
    }
}

impl TierCacheConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults
            .to_entry_options()
            .validate()
            .map_err(|e| ConfigError::validation(format!("defaults: {e}")))?;

        for (name, overrides) in &self.stores {
            if name.is_empty() {
                return Err(ConfigError::validation("store names must not be empty"));
            }
            self.store_options(name)
                .map_err(|e| ConfigError::validation(format!("stores.{name}: {e}")))?;
            if overrides.ttl_ms == Some(0) {
                return Err(ConfigError::validation(format!(
                    "stores.{name}.ttl_ms must be > 0"
                )));
            }
        }

        if self.redis.enabled {
            if self.redis.pool_size == 0 {
                return Err(ConfigError::validation("redis.pool_size must be > 0"));
            }
            if self.redis.url.is_empty() {
                return Err(ConfigError::validation("redis.enabled=true requires redis.url"));
            }
        }

        if self.bus.retry_queue.max_size == Some(0) {
            return Err(ConfigError::validation(
                "bus.retry_queue.max_size must be > 0 when set",
            ));
        }
        if self.bus.retry_interval_ms == 0 {
            return Err(ConfigError::validation("bus.retry_interval_ms must be > 0"));
        }
        if self.bus.publish_timeout_ms == 0 {
            return Err(ConfigError::validation("bus.publish_timeout_ms must be > 0"));
        }

        let level = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&level.as_str()) {
            return Err(ConfigError::validation(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }

        Ok(())
    }

    /// Resolved entry options for store `name` (defaults + its overrides).
    pub fn store_options(&self, name: &str) -> tiercache_core::Result<CacheEntryOptions> {
        let defaults = self.defaults.to_entry_options();
        match self.stores.get(name) {
            Some(overrides) => defaults.merge(&overrides.to_entry_options()),
            None => Ok(defaults),
        }
    }

    /// Names of every configured store, the default store included.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        if !self.stores.contains_key(&self.default_store) {
            names.insert(0, self.default_store.clone());
        }
        names
    }

    /// Memory driver settings for store `name`.
    pub fn memory_config(&self, name: &str) -> MemoryConfig {
        let mut config = self.memory.to_memory_config();
        config.prefix = Some(self.store_prefix(name));
        config
    }

    /// Redis driver settings for store `name`.
    pub fn redis_config(&self, name: &str) -> RedisDriverConfig {
        RedisDriverConfig::new(self.redis.url.clone())
            .with_pool_size(self.redis.pool_size)
            .with_timeout(Duration::from_millis(self.redis.timeout_ms))
            .with_prefix(self.store_prefix(name))
    }

    fn store_prefix(&self, name: &str) -> String {
        match self.stores.get(name).and_then(|s| s.prefix.as_deref()) {
            Some(prefix) => prefix.to_string(),
            None if self.prefix.is_empty() => name.to_string(),
            None => format!("{}:{name}", self.prefix),
        }
    }
}

/// Stack-level entry options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EntryDefaults {
    pub ttl_ms: u64,
    pub early_expiration: Option<f64>,
    pub lock_timeout_ms: Option<u64>,
    pub lock_timeout_behavior: LockTimeoutBehavior,
    pub suppress_remote_cache_errors: bool,
    pub grace_period: GracePeriodSection,
    pub timeouts: TimeoutsSection,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1000,
            early_expiration: None,
            lock_timeout_ms: None,
            lock_timeout_behavior: LockTimeoutBehavior::Fail,
            suppress_remote_cache_errors: true,
            grace_period: GracePeriodSection::default(),
            timeouts: TimeoutsSection::default(),
        }
    }
}

impl EntryDefaults {
    pub fn to_entry_options(&self) -> CacheEntryOptions {
        CacheEntryOptions {
            ttl: Duration::from_millis(self.ttl_ms),
            grace_period: self.grace_period.to_grace_period(),
            early_expiration: self.early_expiration,
            lock_timeout: self.lock_timeout_ms.map(Duration::from_millis),
            lock_timeout_behavior: self.lock_timeout_behavior,
            timeouts: self.timeouts.to_timeouts(),
            suppress_remote_cache_errors: self.suppress_remote_cache_errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GracePeriodSection {
    pub enabled: bool,
    pub duration_ms: u64,
    pub fallback_duration_ms: u64,
}

impl Default for GracePeriodSection {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_ms: 6 * 60 * 60 * 1000,
            fallback_duration_ms: 10_000,
        }
    }
}

impl GracePeriodSection {
    pub fn to_grace_period(&self) -> GracePeriod {
        GracePeriod {
            enabled: self.enabled,
            duration: Duration::from_millis(self.duration_ms),
            fallback_duration: Duration::from_millis(self.fallback_duration_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsSection {
    pub soft_ms: Option<u64>,
    pub hard_ms: Option<u64>,
}

impl TimeoutsSection {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts::new(
            self.soft_ms.map(Duration::from_millis),
            self.hard_ms.map(Duration::from_millis),
        )
    }
}

/// Overrides for one named store. Unset fields inherit `[defaults]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreOverrides {
    /// Replaces the computed `<prefix>:<name>` key prefix.
    pub prefix: Option<String>,
    pub ttl_ms: Option<u64>,
    pub early_expiration: Option<f64>,
    pub lock_timeout_ms: Option<u64>,
    pub lock_timeout_behavior: Option<LockTimeoutBehavior>,
    pub suppress_remote_cache_errors: Option<bool>,
    pub grace_period: Option<GracePeriodSection>,
    pub timeouts: Option<TimeoutsSection>,
}

impl StoreOverrides {
    pub fn to_entry_options(&self) -> EntryOptions {
        let mut options = EntryOptions::new();
        options.ttl = self.ttl_ms.map(Duration::from_millis);
        options.grace_period = self
            .grace_period
            .as_ref()
            .map(GracePeriodSection::to_grace_period);
        options.early_expiration = self.early_expiration.map(Some);
        options.lock_timeout = self.lock_timeout_ms.map(|ms| Some(Duration::from_millis(ms)));
        options.lock_timeout_behavior = self.lock_timeout_behavior;
        options.suppress_remote_cache_errors = self.suppress_remote_cache_errors;
        if let Some(timeouts) = &self.timeouts {
            let timeouts = timeouts.to_timeouts();
            options.soft_timeout = Some(timeouts.soft);
            options.hard_timeout = Some(timeouts.hard);
        }
        options
    }
}

/// In-process L1 settings. Zero means "unbounded" for the byte limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemorySection {
    pub max_items: u64,
    pub max_size_bytes: u64,
    pub max_entry_size_bytes: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_size_bytes: 0,
            max_entry_size_bytes: 0,
        }
    }
}

impl MemorySection {
    pub fn to_memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            max_items: Some(self.max_items),
            max_size: (self.max_size_bytes > 0).then_some(self.max_size_bytes),
            max_entry_size: (self.max_entry_size_bytes > 0).then_some(self.max_entry_size_bytes),
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedisSection {
    /// Redis is optional; without it caches run L1-only.
    pub enabled: bool,
    pub url: String,
    pub pool_size: usize,
    pub timeout_ms: u64,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusSection {
    pub enabled: bool,
    /// Interval between retry-queue drains.
    pub retry_interval_ms: u64,
    /// Publishes still pending after this long are queued for retry.
    pub publish_timeout_ms: u64,
    pub retry_queue: RetryQueueSection,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_ms: 1000,
            publish_timeout_ms: 5000,
            retry_queue: RetryQueueSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryQueueSection {
    pub enabled: bool,
    /// `None` leaves the queue unbounded.
    pub max_size: Option<usize>,
}

impl Default for RetryQueueSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: Some(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TierCacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store_names(), vec!["primary".to_string()]);
        assert!(!config.redis.enabled);
        assert_eq!(config.bus.retry_queue.max_size, Some(1000));
    }

    #[test]
    fn test_store_overrides_merge_onto_defaults() {
        let config = TierCacheConfig::from_toml_str(
            r#"
            [defaults]
            ttl_ms = 60000
            early_expiration = 0.5

            [stores.sessions]
            ttl_ms = 1000
            lock_timeout_behavior = "retry"

            [stores.sessions.grace_period]
            enabled = true
            duration_ms = 5000
            "#,
        )
        .unwrap();

        let sessions = config.store_options("sessions").unwrap();
        assert_eq!(sessions.ttl, Duration::from_millis(1000));
        assert_eq!(sessions.early_expiration, Some(0.5));
        assert_eq!(sessions.lock_timeout_behavior, LockTimeoutBehavior::Retry);
        assert!(sessions.grace_period.enabled);
        assert_eq!(sessions.grace_period.duration, Duration::from_millis(5000));

        let primary = config.store_options("primary").unwrap();
        assert_eq!(primary.ttl, Duration::from_millis(60000));
        assert!(!primary.grace_period.enabled);

        assert_eq!(
            config.store_names(),
            vec!["primary".to_string(), "sessions".to_string()]
        );
    }

    #[test]
    fn test_rejects_invalid_early_expiration() {
        let err =
            TierCacheConfig::from_toml_str("[defaults]\nearly_expiration = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_hard_below_soft() {
        let err = TierCacheConfig::from_toml_str(
            "[defaults.timeouts]\nsoft_ms = 500\nhard_ms = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeouts.hard"));
    }

    #[test]
    fn test_rejects_zero_retry_queue() {
        let err =
            TierCacheConfig::from_toml_str("[bus.retry_queue]\nmax_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("retry_queue"));
    }

    #[test]
    fn test_rejects_zero_publish_timeout() {
        let err = TierCacheConfig::from_toml_str("[bus]\npublish_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("publish_timeout_ms"));
    }

    #[test]
    fn test_rejects_zero_pool_when_enabled() {
        let err = TierCacheConfig::from_toml_str("[redis]\nenabled = true\npool_size = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn test_store_prefixes() {
        let config = TierCacheConfig::from_toml_str(
            "prefix = \"app\"\n[stores.custom]\nprefix = \"other\"\n",
        )
        .unwrap();
        assert_eq!(config.memory_config("primary").prefix.as_deref(), Some("app:primary"));
        assert_eq!(config.redis_config("custom").prefix.as_deref(), Some("other"));
    }

    #[test]
    fn test_memory_zero_means_unbounded() {
        let memory = MemorySection::default().to_memory_config();
        assert_eq!(memory.max_items, Some(1000));
        assert_eq!(memory.max_size, None);
        assert_eq!(memory.max_entry_size, None);
    }

    #[test]
    fn test_toml_round_trip_keeps_stores() {
        let mut config = TierCacheConfig::default();
        config.stores.insert(
            "users".into(),
            StoreOverrides {
                ttl_ms: Some(5000),
                ..Default::default()
            },
        );
        let raw = config.to_toml_string().unwrap();
        assert_eq!(TierCacheConfig::from_toml_str(&raw).unwrap(), config);
    }
}
