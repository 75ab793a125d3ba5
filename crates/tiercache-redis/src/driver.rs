//! Redis remote tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use tiercache_core::{CacheDriver, DriverError, DynDriver, KeyPrefix};

use crate::{driver_error, pool_error};

/// Keys fetched per `SCAN` round trip when clearing a prefix.
const SCAN_BATCH: usize = 500;

/// Connection settings for the Redis driver and bus.
#[derive(Debug, Clone)]
pub struct RedisDriverConfig {
    pub url: String,
    pub pool_size: usize,
    /// Wait/create/recycle timeout for pooled connections.
    pub timeout: Duration,
    pub prefix: Option<String>,
}

impl Default for RedisDriverConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout: Duration::from_millis(5000),
            prefix: None,
        }
    }
}

impl RedisDriverConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Builds a connection pool without touching the network.
    pub fn create_pool(&self) -> Result<Pool, DriverError> {
        let mut config = deadpool_redis::Config::from_url(&self.url);
        let pool_config = config.pool.get_or_insert_with(Default::default);
        pool_config.max_size = self.pool_size;
        pool_config.timeouts.wait = Some(self.timeout);
        pool_config.timeouts.create = Some(self.timeout);
        pool_config.timeouts.recycle = Some(self.timeout);

        config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| DriverError::connection(format!("failed to create Redis pool: {e}")))
    }
}

/// Driver storing entries in Redis.
///
/// Namespaces share the pool. `disconnect` closes the pool for every
/// namespace derived from the same driver.
#[derive(Clone)]
pub struct RedisDriver {
    pool: Pool,
    url: Arc<str>,
    prefix: KeyPrefix,
}

impl RedisDriver {
    /// Creates the pool and checks that Redis answers.
    pub async fn connect(config: &RedisDriverConfig) -> Result<Self, DriverError> {
        let pool = config.create_pool()?;
        let driver = Self::from_pool(pool, &config.url, config.prefix.as_deref());
        driver.ping().await?;
        tracing::info!(url = %config.url, "connected to Redis");
        Ok(driver)
    }

    pub fn from_pool(pool: Pool, url: &str, prefix: Option<&str>) -> Self {
        Self {
            pool,
            url: Arc::from(url),
            prefix: KeyPrefix::new(prefix),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn ping(&self) -> Result<(), DriverError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(driver_error)?;
        Ok(())
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DriverError> {
        self.pool.get().await.map_err(pool_error)
    }

    async fn scan_owned_keys(
        &self,
        conn: &mut deadpool_redis::Connection,
        pattern: &str,
    ) -> Result<Vec<String>, DriverError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(driver_error)?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

impl std::fmt::Debug for RedisDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDriver")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Escapes glob metacharacters so a prefix can be used in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl CacheDriver for RedisDriver {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DriverError> {
        let mut conn = self.connection().await?;
        conn.get(self.prefix.item_key(key))
            .await
            .map_err(driver_error)
    }

    async fn pull(&self, key: &str) -> Result<Option<String>, DriverError> {
        let mut conn = self.connection().await?;
        redis::cmd("GETDEL")
            .arg(self.prefix.item_key(key))
            .query_async(&mut conn)
            .await
            .map_err(driver_error)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        let full_key = self.prefix.item_key(key);
        let mut conn = self.connection().await?;

        match ttl {
            Some(ttl) if ttl.is_zero() => {
                let _: () = conn.del(&full_key).await.map_err(driver_error)?;
            }
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let _: () = redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn)
                    .await
                    .map_err(driver_error)?;
            }
            None => {
                let _: () = conn.set(&full_key, value).await.map_err(driver_error)?;
            }
        }
        Ok(true)
    }

    async fn has(&self, key: &str) -> Result<bool, DriverError> {
        let mut conn = self.connection().await?;
        conn.exists(self.prefix.item_key(key))
            .await
            .map_err(driver_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, DriverError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .del(self.prefix.item_key(key))
            .await
            .map_err(driver_error)?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool, DriverError> {
        if keys.is_empty() {
            return Ok(true);
        }
        let full_keys: Vec<String> = keys.iter().map(|k| self.prefix.item_key(k)).collect();
        let mut conn = self.connection().await?;
        let _: u64 = conn.del(full_keys).await.map_err(driver_error)?;
        Ok(true)
    }

    async fn clear(&self) -> Result<(), DriverError> {
        let mut conn = self.connection().await?;

        let Some(prefix) = self.prefix.as_str() else {
            let _: () = redis::cmd("FLUSHDB")
                .query_async(&mut conn)
                .await
                .map_err(driver_error)?;
            return Ok(());
        };

        let pattern = format!("{}:*", escape_glob(prefix));
        let keys = self.scan_owned_keys(&mut conn, &pattern).await?;
        tracing::debug!(prefix, count = keys.len(), "clearing Redis prefix");

        for chunk in keys.chunks(SCAN_BATCH) {
            let _: u64 = conn.del(chunk).await.map_err(driver_error)?;
        }
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, DriverError> {
        let mut conn = self.connection().await?;
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.prefix.item_key(key))
            .query_async(&mut conn)
            .await
            .map_err(driver_error)?;

        // -2: missing key, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    fn namespace(&self, namespace: &str) -> DynDriver {
        Arc::new(Self {
            pool: self.pool.clone(),
            url: self.url.clone(),
            prefix: self.prefix.namespace(namespace),
        })
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("app:users"), "app:users");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_pool_created_without_network() {
        let config = RedisDriverConfig::new("redis://127.0.0.1:1")
            .with_pool_size(2)
            .with_timeout(Duration::from_millis(50));
        let pool = config.create_pool().unwrap();
        assert_eq!(pool.status().max_size, 2);
    }

    #[tokio::test]
    async fn test_connect_fails_fast_when_unreachable() {
        let config =
            RedisDriverConfig::new("redis://127.0.0.1:1").with_timeout(Duration::from_millis(200));
        let err = RedisDriver::connect(&config).await.unwrap_err();
        assert!(matches!(err, DriverError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_closed_pool_reports_disconnected() {
        let config = RedisDriverConfig::new("redis://127.0.0.1:1");
        let driver = RedisDriver::from_pool(config.create_pool().unwrap(), &config.url, None);
        driver.disconnect().await.unwrap();
        assert!(matches!(
            driver.get("k").await,
            Err(DriverError::Disconnected)
        ));
    }
}
