//! Building caches from [`TierCacheConfig`].

use tiercache_config::TierCacheConfig;
use tiercache_core::{EventEmitter, Result};
use tiercache_memory::MemoryDriver;
use tiercache_redis::{RedisBus, RedisDriver};

use crate::bus::BusOptions;
use crate::cache::Cache;

/// Creates store `name`: memory L1 and, when `[redis]` is enabled, a Redis
/// L2 plus a Redis bus.
///
/// An unreachable Redis never fails the call: the cache comes up L1-only
/// and a warning is logged.
pub async fn create_cache(name: &str, config: &TierCacheConfig) -> Result<Cache> {
    create_cache_with_emitter(name, config, EventEmitter::new()).await
}

pub async fn create_cache_with_emitter(
    name: &str,
    config: &TierCacheConfig,
    emitter: EventEmitter,
) -> Result<Cache> {
    let mut builder = Cache::builder(name)
        .local(MemoryDriver::new(config.memory_config(name)))
        .defaults(config.store_options(name)?)
        .emitter(emitter);

    if config.redis.enabled {
        let redis = config.redis_config(name);
        match RedisDriver::connect(&redis).await {
            Ok(driver) => {
                if config.bus.enabled {
                    let transport = RedisBus::new(driver.pool().clone(), driver.url());
                    builder = builder.bus(transport, BusOptions::from(&config.bus));
                }
                builder = builder.remote(driver);
            }
            Err(e) => {
                tracing::warn!(
                    cache = name,
                    url = %redis.url,
                    error = %e,
                    "redis unavailable, running with the local tier only"
                );
            }
        }
    }

    let cache = builder.build().await?;
    tracing::info!(
        cache = name,
        remote = cache.has_remote(),
        bus = cache.bus().is_some(),
        "cache created"
    );
    Ok(cache)
}
