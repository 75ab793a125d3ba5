//! In-memory LRU driver backed by moka.
//!
//! Entries carry their own TTL (moka `Expiry`), the store is bounded by item
//! count and optionally by total byte size, and namespaces share one store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashSet;
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use tiercache_core::{CacheDriver, DriverError, DynDriver, KeyPrefix};

/// Default number of entries kept when `max_items` is not configured.
const DEFAULT_MAX_ITEMS: u64 = 1000;

/// Memory driver configuration.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Maximum number of entries (default 1000). Applies together with
    /// `max_size` when both are set.
    pub max_items: Option<u64>,
    /// Maximum total size in bytes of all stored values.
    pub max_size: Option<u64>,
    /// Values larger than this many bytes are refused.
    pub max_entry_size: Option<u64>,
    pub prefix: Option<String>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: u64) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.max_entry_size = Some(max_entry_size);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[derive(Clone)]
struct StoredValue {
    data: Arc<str>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: String, ttl: Option<Duration>) -> Self {
        Self {
            data: Arc::from(data),
            ttl,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

struct PerEntryExpiry;

impl Expiry<String, StoredValue> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

impl Expiry<String, Option<Duration>> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        ttl: &Option<Duration>,
        _created_at: Instant,
    ) -> Option<Duration> {
        *ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        ttl: &Option<Duration>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        *ttl
    }
}

/// Item-count bound for a byte-weighted store.
///
/// `order` mirrors the store's keys with unit weight; what it evicts by
/// size is evicted from the store, and what the store evicts by size is
/// dropped from `order`.
struct ItemBound {
    order: Cache<String, Option<Duration>>,
    evicted: Arc<DashSet<String>>,
    released: Arc<DashSet<String>>,
}

impl ItemBound {
    fn new(max_items: u64) -> Self {
        let evicted = Arc::new(DashSet::new());
        let on_evict = evicted.clone();
        let order = Cache::builder()
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(PerEntryExpiry)
            .max_capacity(max_items)
            .eviction_listener(move |key: Arc<String>, _ttl, cause| {
                if cause == RemovalCause::Size {
                    on_evict.insert(key.to_string());
                }
            })
            .build();

        Self {
            order,
            evicted,
            released: Arc::new(DashSet::new()),
        }
    }
}

fn take_all(set: &DashSet<String>) -> Vec<String> {
    let keys: Vec<String> = set.iter().map(|key| key.key().clone()).collect();
    for key in &keys {
        set.remove(key);
    }
    keys
}

/// In-process cache driver.
///
/// Cloning is cheap; clones and namespaces share the same store.
#[derive(Clone)]
pub struct MemoryDriver {
    cache: Cache<String, StoredValue>,
    /// Set only when the store is byte-weighted.
    items: Option<Arc<ItemBound>>,
    prefix: KeyPrefix,
    max_entry_size: Option<u64>,
}

impl MemoryDriver {
    pub fn new(config: MemoryConfig) -> Self {
        let builder = Cache::builder()
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(PerEntryExpiry);

        let max_items = config.max_items.unwrap_or(DEFAULT_MAX_ITEMS);

        let (cache, items) = match config.max_size {
            Some(max_size) => {
                let items = ItemBound::new(max_items);
                let on_evict = items.released.clone();
                let cache = builder
                    .weigher(|_key: &String, value: &StoredValue| {
                        u32::try_from(value.data.len()).unwrap_or(u32::MAX)
                    })
                    .max_capacity(max_size)
                    .eviction_listener(move |key: Arc<String>, _value, cause| {
                        if cause == RemovalCause::Size {
                            on_evict.insert(key.to_string());
                        }
                    })
                    .build();
                (cache, Some(Arc::new(items)))
            }
            None => (builder.max_capacity(max_items).build(), None),
        };

        Self {
            cache,
            items,
            prefix: KeyPrefix::new(config.prefix.as_deref()),
            max_entry_size: config.max_entry_size,
        }
    }

    /// Approximate number of entries in the shared store (all namespaces).
    pub async fn entry_count(&self) -> u64 {
        self.enforce_item_bound().await;
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    async fn live(&self, full_key: &str) -> Option<StoredValue> {
        let value = self.cache.get(full_key).await.filter(StoredValue::is_live)?;
        if let Some(items) = &self.items {
            // Keeps the key's recency in the count bound.
            items.order.get(full_key).await;
        }
        Some(value)
    }

    /// Applies the evictions each bound decided on to the other one.
    async fn enforce_item_bound(&self) {
        let Some(items) = &self.items else {
            return;
        };
        items.order.run_pending_tasks().await;
        for key in take_all(&items.released) {
            items.order.invalidate(&key).await;
        }
        for key in take_all(&items.evicted) {
            tracing::trace!(key = %key, "evicted by item bound");
            self.cache.invalidate(&key).await;
        }
    }

    async fn forget(&self, full_key: &str) {
        if let Some(items) = &self.items {
            items.order.invalidate(full_key).await;
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl CacheDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DriverError> {
        let full_key = self.prefix.item_key(key);
        Ok(self.live(&full_key).await.map(|v| v.data.to_string()))
    }

    async fn pull(&self, key: &str) -> Result<Option<String>, DriverError> {
        let full_key = self.prefix.item_key(key);
        self.forget(&full_key).await;
        Ok(self
            .cache
            .remove(&full_key)
            .await
            .filter(StoredValue::is_live)
            .map(|v| v.data.to_string()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        let full_key = self.prefix.item_key(key);

        if let Some(max) = self.max_entry_size
            && value.len() as u64 > max
        {
            tracing::debug!(key = %full_key, size = value.len(), max, "value exceeds max entry size");
            return Ok(false);
        }

        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            self.forget(&full_key).await;
            self.cache.invalidate(&full_key).await;
            return Ok(true);
        }

        if let Some(items) = &self.items {
            items.order.insert(full_key.clone(), ttl).await;
        }
        self.cache.insert(full_key, StoredValue::new(value, ttl)).await;
        self.enforce_item_bound().await;
        Ok(true)
    }

    async fn has(&self, key: &str) -> Result<bool, DriverError> {
        let full_key = self.prefix.item_key(key);
        Ok(self.live(&full_key).await.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, DriverError> {
        let full_key = self.prefix.item_key(key);
        self.forget(&full_key).await;
        Ok(self
            .cache
            .remove(&full_key)
            .await
            .is_some_and(|v| v.is_live()))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool, DriverError> {
        for key in keys {
            let full_key = self.prefix.item_key(key);
            self.forget(&full_key).await;
            self.cache.invalidate(&full_key).await;
        }
        Ok(true)
    }

    async fn clear(&self) -> Result<(), DriverError> {
        if self.prefix.is_empty() {
            if let Some(items) = &self.items {
                items.order.invalidate_all();
            }
            self.cache.invalidate_all();
            return Ok(());
        }

        let owned: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| self.prefix.owns(key))
            .map(|(key, _)| key.to_string())
            .collect();

        for key in owned {
            self.forget(&key).await;
            self.cache.invalidate(&key).await;
        }
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, DriverError> {
        let full_key = self.prefix.item_key(key);
        Ok(self
            .live(&full_key)
            .await
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    fn namespace(&self, namespace: &str) -> DynDriver {
        Arc::new(Self {
            cache: self.cache.clone(),
            items: self.items.clone(),
            prefix: self.prefix.namespace(namespace),
            max_entry_size: self.max_entry_size,
        })
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let driver = MemoryDriver::default();
        assert!(driver.set("k", "v".into(), None).await.unwrap());
        assert_eq!(driver.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(driver.has("k").await.unwrap());
        assert_eq!(driver.remaining_ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_per_entry_ttl() {
        let driver = MemoryDriver::default();
        driver
            .set("short", "v".into(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        driver.set("long", "v".into(), None).await.unwrap();

        let remaining = driver.remaining_ttl("short").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(driver.get("short").await.unwrap(), None);
        assert!(driver.has("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_resets_ttl() {
        let driver = MemoryDriver::default();
        driver
            .set("k", "a".into(), Some(Duration::from_millis(40)))
            .await
            .unwrap();
        driver.set("k", "b".into(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(driver.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_pull_removes() {
        let driver = MemoryDriver::default();
        driver.set("k", "v".into(), None).await.unwrap();
        assert_eq!(driver.pull("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(driver.pull("k").await.unwrap(), None);
        assert!(!driver.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let driver = MemoryDriver::default();
        driver.set("k", "v".into(), None).await.unwrap();
        assert!(driver.delete("k").await.unwrap());
        assert!(!driver.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_max_entry_size_refuses_large_values() {
        let driver = MemoryDriver::new(MemoryConfig::new().with_max_entry_size(4));
        assert!(!driver.set("big", "12345".into(), None).await.unwrap());
        assert!(driver.set("small", "1234".into(), None).await.unwrap());
        assert!(!driver.has("big").await.unwrap());
    }

    #[tokio::test]
    async fn test_max_items_bounds_store() {
        let driver = MemoryDriver::new(MemoryConfig::new().with_max_items(10));
        for i in 0..50 {
            driver.set(&format!("k{i}"), "v".into(), None).await.unwrap();
        }
        assert!(driver.entry_count().await <= 10);
    }

    #[tokio::test]
    async fn test_max_items_applies_with_max_size() {
        let driver =
            MemoryDriver::new(MemoryConfig::new().with_max_items(2).with_max_size(1_000_000));
        for i in 0..20 {
            driver.set(&format!("k{i}"), "v".into(), None).await.unwrap();
        }
        assert!(driver.entry_count().await <= 2);
        assert!(driver.has("k19").await.unwrap());
    }

    #[tokio::test]
    async fn test_max_size_bounds_bytes() {
        let driver = MemoryDriver::new(MemoryConfig::new().with_max_items(100).with_max_size(10));
        for i in 0..5 {
            driver.set(&format!("k{i}"), "1234".into(), None).await.unwrap();
        }
        assert!(driver.entry_count().await <= 2);
    }
}
