//! Tier facades.
//!
//! A facade turns a string-keyed driver into a store of [`CacheEntry`]
//! values: it serializes envelopes, derives physical TTLs, times every call
//! and treats corrupt envelopes as absent keys. The remote facade adds
//! soft/hard deadlines on top (see [`remote`]).

pub mod remote;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tiercache_core::{
    CacheEntry, CacheError, CacheSerializer, DriverError, DynDriver, KeyPrefix, Result, Tier,
    now_millis,
};

use crate::metrics;

pub use remote::RemoteTier;

/// Entry-level view of a driver for one tier.
#[derive(Clone)]
pub struct TierFacade {
    tier: Tier,
    driver: DynDriver,
    serializer: Arc<dyn CacheSerializer>,
}

impl TierFacade {
    pub fn new(tier: Tier, driver: DynDriver, serializer: Arc<dyn CacheSerializer>) -> Self {
        Self {
            tier,
            driver,
            serializer,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn driver(&self) -> &DynDriver {
        &self.driver
    }

    pub fn prefix(&self) -> &KeyPrefix {
        self.driver.prefix()
    }

    pub fn serializer(&self) -> &Arc<dyn CacheSerializer> {
        &self.serializer
    }

    /// Facade whose keys live under `namespace`, sharing the same store.
    pub fn namespace(&self, namespace: &str) -> Self {
        Self {
            tier: self.tier,
            driver: self.driver.namespace(namespace),
            serializer: self.serializer.clone(),
        }
    }

    /// Reads and decodes an entry. A corrupt envelope is logged, removed and
    /// reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let raw = self.timed("get", self.driver.get(key)).await?;
        Ok(self.decode_or_evict(key, raw).await)
    }

    /// Reads and removes an entry.
    pub async fn pull(&self, key: &str) -> Result<Option<CacheEntry>> {
        let raw = self.timed("pull", self.driver.pull(key)).await?;
        Ok(raw.and_then(|raw| self.decode(key, &raw)))
    }

    /// Stores `entry` with a physical TTL derived from its timestamps.
    ///
    /// An entry already past retention is removed instead. Returns `false`
    /// when nothing was stored.
    pub async fn set(&self, key: &str, entry: &CacheEntry, fallback: Duration) -> Result<bool> {
        let Some(ttl) = entry.physical_ttl(now_millis(), fallback) else {
            self.delete(key).await?;
            return Ok(false);
        };
        let raw = self.serializer.serialize(entry)?;
        self.set_raw(key, raw, Some(ttl)).await
    }

    pub async fn set_raw(&self, key: &str, raw: String, ttl: Option<Duration>) -> Result<bool> {
        let stored = self.timed("set", self.driver.set(key, raw, ttl)).await?;
        if !stored {
            tracing::debug!(tier = self.tier.as_str(), key, "driver refused value");
        }
        Ok(stored)
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.timed("has", self.driver.has(key)).await?)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.timed("delete", self.driver.delete(key)).await?)
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<bool> {
        Ok(self.timed("delete_many", self.driver.delete_many(keys)).await?)
    }

    pub async fn clear(&self) -> Result<()> {
        Ok(self.timed("clear", self.driver.clear()).await?)
    }

    pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .timed("remaining_ttl", self.driver.remaining_ttl(key))
            .await?)
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.driver.disconnect().await?)
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, DriverError>>,
    ) -> std::result::Result<T, DriverError> {
        let started = Instant::now();
        let result = fut.await;
        metrics::record_tier_operation(self.tier, operation, result.is_ok(), started.elapsed());
        result
    }

    fn decode(&self, key: &str, raw: &str) -> Option<CacheEntry> {
        match self.serializer.deserialize(raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(
                    tier = self.tier.as_str(),
                    key = %self.prefix().item_key(key),
                    error = %e,
                    "discarding corrupt cache entry"
                );
                None
            }
        }
    }

    async fn decode_or_evict(&self, key: &str, raw: Option<String>) -> Option<CacheEntry> {
        let raw = raw?;
        let entry = self.decode(key, &raw);
        if entry.is_none()
            && let Err(e) = self.driver.delete(key).await
        {
            tracing::debug!(tier = self.tier.as_str(), key, error = %e, "failed to evict corrupt entry");
        }
        entry
    }
}

impl std::fmt::Debug for TierFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierFacade")
            .field("tier", &self.tier.as_str())
            .field("driver", &self.driver.name())
            .field("prefix", self.prefix())
            .finish()
    }
}

/// Applies the caller's suppression policy to a remote-tier result.
pub(crate) fn suppress<T: Default>(
    result: Result<T>,
    suppress_errors: bool,
    operation: &'static str,
    key: Option<&str>,
) -> Result<T> {
    match result {
        Err(e) if suppress_errors && e.is_remote_failure() => {
            tracing::warn!(operation, key, error = %e, "remote tier failure suppressed");
            Ok(T::default())
        }
        other => other,
    }
}
