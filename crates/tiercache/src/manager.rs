//! Several named caches behind one handle.

use std::collections::HashMap;

use tiercache_config::TierCacheConfig;
use tiercache_core::{CacheError, EventEmitter, Result};

use crate::cache::Cache;
use crate::factory::create_cache_with_emitter;

/// Named stores with a default one.
///
/// Stores built by [`CacheManager::from_config`] publish their events on a
/// single shared emitter.
pub struct CacheManager {
    default_store: String,
    stores: HashMap<String, Cache>,
    emitter: EventEmitter,
}

impl CacheManager {
    pub fn new(default_store: impl Into<String>) -> Self {
        Self {
            default_store: default_store.into(),
            stores: HashMap::new(),
            emitter: EventEmitter::new(),
        }
    }

    /// Builds every store listed in `config`.
    pub async fn from_config(config: &TierCacheConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CacheError::configuration(e.to_string()))?;

        let mut manager = Self::new(config.default_store.clone());
        for name in config.store_names() {
            let cache = create_cache_with_emitter(&name, config, manager.emitter.clone()).await?;
            manager.stores.insert(name, cache);
        }

        tracing::info!(
            stores = manager.stores.len(),
            default_store = %manager.default_store,
            "cache manager ready"
        );
        Ok(manager)
    }

    /// Registers `cache` under its name, replacing any previous store.
    pub fn insert(&mut self, cache: Cache) -> Option<Cache> {
        self.stores.insert(cache.name().to_string(), cache)
    }

    pub fn store(&self, name: &str) -> Result<&Cache> {
        self.stores
            .get(name)
            .ok_or_else(|| CacheError::configuration(format!("unknown cache store '{name}'")))
    }

    pub fn default_store(&self) -> Result<&Cache> {
        self.store(&self.default_store)
    }

    pub fn default_store_name(&self) -> &str {
        &self.default_store
    }

    pub fn store_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        for cache in self.stores.values() {
            cache.disconnect().await?;
        }
        Ok(())
    }
}
