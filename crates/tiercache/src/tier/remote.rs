//! Remote tier facade with latency bounds.
//!
//! Reads are bounded by a deadline and fail with [`CacheError::Timeout`]
//! when it passes. Writes run in their own task: the caller waits at most
//! the soft timeout and the write keeps going in the background afterwards.

use std::future::Future;
use std::time::Duration;

use tiercache_core::{CacheEntry, CacheError, DriverError, Result, Timeouts};

use super::TierFacade;

#[derive(Clone, Debug)]
pub struct RemoteTier {
    facade: TierFacade,
}

impl RemoteTier {
    pub fn new(facade: TierFacade) -> Self {
        Self { facade }
    }

    pub fn facade(&self) -> &TierFacade {
        &self.facade
    }

    pub fn namespace(&self, namespace: &str) -> Self {
        Self::new(self.facade.namespace(namespace))
    }

    /// Reads an entry, giving up after the hard timeout.
    pub async fn get(&self, key: &str, timeouts: &Timeouts) -> Result<Option<CacheEntry>> {
        bounded("remote.get", timeouts.hard, self.facade.get(key)).await
    }

    /// Reads an entry, giving up after the soft timeout (hard if unset).
    ///
    /// Used when a stale local value is available to fall back on.
    pub async fn get_soft(&self, key: &str, timeouts: &Timeouts) -> Result<Option<CacheEntry>> {
        bounded("remote.get", timeouts.soft_or_hard(), self.facade.get(key)).await
    }

    pub async fn pull(&self, key: &str, timeouts: &Timeouts) -> Result<Option<CacheEntry>> {
        bounded("remote.pull", timeouts.hard, self.facade.pull(key)).await
    }

    /// Entry lookup for presence checks, bounded by the soft timeout.
    pub async fn peek(&self, key: &str, timeouts: &Timeouts) -> Result<Option<CacheEntry>> {
        bounded("remote.has", timeouts.soft_or_hard(), self.facade.get(key)).await
    }

    /// Writes an entry in a detached task.
    ///
    /// Errors that happen within the soft timeout are returned; past it the
    /// caller proceeds and a late failure is only logged.
    pub async fn set(
        &self,
        key: &str,
        entry: &CacheEntry,
        fallback: Duration,
        timeouts: &Timeouts,
    ) -> Result<()> {
        let facade = self.facade.clone();
        let owned_key = key.to_string();
        let entry = entry.clone();
        let hard = timeouts.hard;

        let write = tokio::spawn(async move {
            let result =
                bounded("remote.set", hard, facade.set(&owned_key, &entry, fallback)).await;
            if let Err(e) = &result {
                tracing::debug!(key = %owned_key, error = %e, "remote write failed");
            }
            result.map(|_| ())
        });

        let joined = match timeouts.soft {
            Some(soft) => match tokio::time::timeout(soft, write).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!(key, soft_ms = soft.as_millis() as u64, "remote write continues in background");
                    return Ok(());
                }
            },
            None => write.await,
        };

        joined.map_err(|e| DriverError::command(format!("remote write task failed: {e}")))?
    }

    pub async fn delete(&self, key: &str, timeouts: &Timeouts) -> Result<bool> {
        bounded("remote.delete", timeouts.hard, self.facade.delete(key)).await
    }

    pub async fn delete_many(&self, keys: &[String], timeouts: &Timeouts) -> Result<bool> {
        bounded("remote.delete_many", timeouts.hard, self.facade.delete_many(keys)).await
    }

    pub async fn clear(&self, timeouts: &Timeouts) -> Result<()> {
        bounded("remote.clear", timeouts.hard, self.facade.clear()).await
    }

    pub async fn remaining_ttl(&self, key: &str, timeouts: &Timeouts) -> Result<Option<Duration>> {
        bounded("remote.remaining_ttl", timeouts.hard, self.facade.remaining_ttl(key)).await
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CacheError::timeout(operation, limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tiercache_core::{JsonSerializer, Tier, now_millis};
    use tiercache_memory::MemoryDriver;

    fn remote() -> RemoteTier {
        RemoteTier::new(TierFacade::new(
            Tier::Remote,
            Arc::new(MemoryDriver::default()),
            Arc::new(JsonSerializer),
        ))
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded("remote.get", Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CacheError::Timeout { operation: "remote.get", .. }));
        assert!(err.is_remote_failure());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let remote = remote();
        let timeouts = Timeouts::new(Some(Duration::from_millis(100)), Some(Duration::from_secs(1)));
        let entry = CacheEntry::new(json!({"a": 1}), now_millis() + 5_000, None, None).unwrap();

        remote.set("k", &entry, Duration::ZERO, &timeouts).await.unwrap();
        assert_eq!(remote.get("k", &timeouts).await.unwrap(), Some(entry));
        assert!(remote.delete("k", &timeouts).await.unwrap());
    }
}
