//! The driver contract implemented by every backing store.
//!
//! Drivers are dumb key/value stores: keys are strings (the driver applies
//! its own prefix), values are opaque serialized envelopes. All lifecycle
//! logic lives above them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::key::KeyPrefix;

/// Shareable driver handle.
pub type DynDriver = Arc<dyn CacheDriver>;

/// Uniform operations against a tier's backing store.
///
/// Implementations must be thread-safe; a driver and all namespaces derived
/// from it share one underlying store.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Short backend name for logs ("memory", "redis", ...).
    fn name(&self) -> &'static str;

    /// Prefix applied to every key handled by this driver.
    fn prefix(&self) -> &KeyPrefix;

    async fn get(&self, key: &str) -> Result<Option<String>, DriverError>;

    /// Returns the value and removes it.
    async fn pull(&self, key: &str) -> Result<Option<String>, DriverError>;

    /// Stores `value`. `ttl = None` means no physical expiry.
    ///
    /// Returns `false` when the store refused the value (e.g. too large).
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<bool, DriverError>;

    async fn has(&self, key: &str) -> Result<bool, DriverError>;

    /// Returns `true` if a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, DriverError>;

    async fn delete_many(&self, keys: &[String]) -> Result<bool, DriverError>;

    /// Removes every key under this driver's prefix.
    async fn clear(&self) -> Result<(), DriverError>;

    /// Remaining physical TTL, `None` when absent or without expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, DriverError>;

    /// A driver for `namespace`, sharing the same store.
    fn namespace(&self, namespace: &str) -> DynDriver;

    async fn disconnect(&self) -> Result<(), DriverError>;
}

/// Driver that stores nothing. Every read misses and every write succeeds.
#[derive(Debug, Clone, Default)]
pub struct NoOpDriver {
    prefix: KeyPrefix,
}

impl NoOpDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheDriver for NoOpDriver {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn pull(&self, _key: &str) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn has(&self, _key: &str) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn delete(&self, _key: &str) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn clear(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn remaining_ttl(&self, _key: &str) -> Result<Option<Duration>, DriverError> {
        Ok(None)
    }

    fn namespace(&self, namespace: &str) -> DynDriver {
        Arc::new(Self {
            prefix: self.prefix.namespace(namespace),
        })
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        Ok(())
    }
}
