//! The cache orchestrator.
//!
//! [`Cache`] implements the read/write/invalidate protocol on top of the
//! tiers: L1 answers fresh reads on its own, L2 is consulted on misses and
//! bounded by the configured timeouts, recomputation is serialized per key,
//! and stale values are served from the grace window when the remote tier
//! or the factory fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tiercache_core::{
    BoxError, CacheEntry, CacheEntryOptions, CacheError, CacheEvent, EntryOptions, EntryState,
    EventEmitter, InvalidationMessage, LockTimeoutBehavior, Result, Tier, now_millis,
};

use crate::bus::InvalidationBus;
use crate::lock::LockHandle;
use crate::metrics;
use crate::stack::{CacheBuilder, CacheStack};
use crate::tier::suppress;

/// A named multi-tier cache, or a namespace within one.
///
/// Cloning is cheap; clones share tiers, locks and the bus.
#[derive(Clone)]
pub struct Cache {
    stack: Arc<CacheStack>,
}

impl Cache {
    pub fn builder(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder::new(name)
    }

    pub(crate) fn from_stack(stack: CacheStack) -> Self {
        Self {
            stack: Arc::new(stack),
        }
    }

    pub fn name(&self) -> &str {
        &self.stack.name
    }

    /// Full namespace path (`users:admins`), `None` for the root cache.
    pub fn namespace_path(&self) -> Option<&str> {
        self.stack.namespace.as_deref()
    }

    pub fn defaults(&self) -> &CacheEntryOptions {
        &self.stack.defaults
    }

    pub fn events(&self) -> &EventEmitter {
        &self.stack.emitter
    }

    pub fn bus(&self) -> Option<&Arc<InvalidationBus>> {
        self.stack.bus()
    }

    pub fn has_local(&self) -> bool {
        self.stack.local.is_some()
    }

    pub fn has_remote(&self) -> bool {
        self.stack.remote.is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.stack.shared.is_disconnected()
    }

    /// A cache whose keys live under `namespace`, sharing tiers and bus.
    /// Namespaces nest: `cache.namespace("a").namespace("b")` is `a:b`.
    pub fn namespace(&self, namespace: &str) -> Cache {
        Self::from_stack(self.stack.namespace(namespace))
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_with(key, &EntryOptions::default()).await
    }

    /// Reads `key` without computing it.
    ///
    /// Fresh L1 values are returned without touching L2. Otherwise L2 is
    /// read; when it fails and errors are suppressed the read is a miss, and
    /// a grace-stale L1 value is served if L2 cannot do better within the
    /// soft timeout.
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &EntryOptions,
    ) -> Result<Option<T>> {
        self.ensure_connected()?;
        let opts = self.resolve(options)?;
        match self.read_entry(key, &opts).await? {
            Some(entry) => Ok(Some(entry.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn get_or_set<T, F, Fut, E>(&self, key: &str, factory: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.get_or_set_with(key, &EntryOptions::default(), factory)
            .await
    }

    /// Returns the cached value for `key`, computing it with `factory` when
    /// there is no valid one.
    ///
    /// Concurrent callers for the same key run the factory at most once. An
    /// early-stale value is returned immediately and refreshed in the
    /// background. When the factory fails, a grace-stale value is served
    /// instead of the error.
    pub async fn get_or_set_with<T, F, Fut, E>(
        &self,
        key: &str,
        options: &EntryOptions,
        factory: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.ensure_connected()?;
        let opts = self.resolve(options)?;

        let local = self.local_entry(key).await?;
        if let Some(entry) = &local {
            match entry.state(now_millis()) {
                EntryState::Fresh => {
                    self.record_hit(key, Tier::Local, false);
                    return entry.decode();
                }
                EntryState::EarlyStale => {
                    self.record_hit(key, Tier::Local, false);
                    self.spawn_refresh(key, opts, factory);
                    return entry.decode();
                }
                EntryState::GraceStale | EntryState::Expired => {}
            }
        }

        let value = self.compute(key, &opts, local, factory).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `true` when either tier holds a value that has not expired.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.ensure_connected()?;
        let opts = &self.stack.defaults;
        let now = now_millis();

        if let Some(entry) = self.local_entry(key).await?
            && entry.state(now).is_servable()
        {
            return Ok(true);
        }

        let Some(remote) = &self.stack.remote else {
            return Ok(false);
        };
        let entry = suppress(
            remote.peek(key, &opts.timeouts).await,
            opts.suppress_remote_cache_errors,
            "has",
            Some(key),
        )?;
        Ok(entry.is_some_and(|e| e.state(now).is_servable()))
    }

    pub async fn missing(&self, key: &str) -> Result<bool> {
        Ok(!self.has(key).await?)
    }

    /// Remaining physical lifetime of `key` in the first tier holding it.
    pub async fn get_remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_connected()?;
        if let Some(local) = &self.stack.local
            && let Some(ttl) = local.remaining_ttl(key).await?
        {
            return Ok(Some(ttl));
        }
        match &self.stack.remote {
            Some(remote) => {
                let opts = &self.stack.defaults;
                suppress(
                    remote.remaining_ttl(key, &opts.timeouts).await,
                    opts.suppress_remote_cache_errors,
                    "remaining_ttl",
                    Some(key),
                )
            }
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with(key, value, &EntryOptions::default()).await
    }

    /// Writes `value` through both tiers and publishes it to siblings.
    pub async fn set_with<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: &EntryOptions,
    ) -> Result<()> {
        self.ensure_connected()?;
        let opts = self.resolve(options)?;
        let entry = opts.build_entry(serde_json::to_value(value)?, now_millis())?;
        self.write_through(key, &entry, &opts).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_with(key, &EntryOptions::default()).await
    }

    /// Removes `key` from both tiers. Returns whether anything was removed;
    /// deleting an absent key is not an error.
    pub async fn delete_with(&self, key: &str, options: &EntryOptions) -> Result<bool> {
        self.ensure_connected()?;
        let opts = self.resolve(options)?;

        let mut removed = false;
        if let Some(local) = &self.stack.local {
            removed |= local.delete(key).await?;
        }
        if let Some(remote) = &self.stack.remote {
            removed |= suppress(
                remote.delete(key, &opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "delete",
                Some(key),
            )?;
        }

        self.publish(InvalidationMessage::delete(
            vec![key.to_string()],
            self.stack.namespace.clone(),
            self.origin_id(),
        ));
        self.emit_deleted(key);
        Ok(removed)
    }

    pub async fn delete_many<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_connected()?;
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Ok(());
        }
        let opts = &self.stack.defaults;

        if let Some(local) = &self.stack.local {
            local.delete_many(&keys).await?;
        }
        if let Some(remote) = &self.stack.remote {
            suppress(
                remote.delete_many(&keys, &opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "delete_many",
                None,
            )?;
        }

        for key in &keys {
            self.emit_deleted(key);
        }
        self.publish(InvalidationMessage::delete(
            keys,
            self.stack.namespace.clone(),
            self.origin_id(),
        ));
        Ok(())
    }

    pub async fn pull<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.ensure_connected()?;
        let opts = &self.stack.defaults;

        let local = match &self.stack.local {
            Some(local) => local.pull(key).await?,
            None => None,
        };
        let remote = match &self.stack.remote {
            Some(remote) => suppress(
                remote.pull(key, &opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "pull",
                Some(key),
            )?,
            None => None,
        };

        self.publish(InvalidationMessage::delete(
            vec![key.to_string()],
            self.stack.namespace.clone(),
            self.origin_id(),
        ));
        self.emit_deleted(key);

        let now = now_millis();
        let found = [(Tier::Local, local), (Tier::Remote, remote)]
            .into_iter()
            .find_map(|(tier, entry)| {
                entry
                    .filter(|e| e.state(now).is_servable())
                    .map(|e| (tier, e))
            });

        match found {
            Some((tier, entry)) => {
                self.record_hit(key, tier, entry.state(now) == EntryState::GraceStale);
                Ok(Some(entry.decode()?))
            }
            None => {
                self.record_miss(key);
                Ok(None)
            }
        }
    }

    /// Removes every key of this cache (or of this namespace).
    pub async fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        let opts = &self.stack.defaults;

        if let Some(local) = &self.stack.local {
            local.clear().await?;
        }
        if let Some(remote) = &self.stack.remote {
            suppress(
                remote.clear(&opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "clear",
                None,
            )?;
        }

        self.publish(InvalidationMessage::clear(
            self.stack.namespace.clone(),
            self.origin_id(),
        ));
        self.stack.emitter.emit(CacheEvent::Cleared {
            cache: self.stack.name.to_string(),
            namespace: self.stack.namespace.clone(),
        });
        Ok(())
    }

    /// Releases drivers and the bus for this cache and all its namespaces.
    ///
    /// Idempotent. Every later operation fails with
    /// [`CacheError::Disconnected`].
    pub async fn disconnect(&self) -> Result<()> {
        self.stack.shared.disconnect(&self.stack.name).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn ensure_connected(&self) -> Result<()> {
        if self.is_disconnected() {
            return Err(CacheError::Disconnected);
        }
        Ok(())
    }

    fn resolve(&self, overrides: &EntryOptions) -> Result<CacheEntryOptions> {
        if *overrides == EntryOptions::default() {
            return Ok(self.stack.defaults.clone());
        }
        self.stack.defaults.merge(overrides)
    }

    fn origin_id(&self) -> String {
        self.stack
            .bus()
            .map(|bus| bus.origin_id().to_string())
            .unwrap_or_default()
    }

    async fn local_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        match &self.stack.local {
            Some(local) => local.get(key).await,
            None => Ok(None),
        }
    }

    /// Best-effort L1 write used on read paths.
    async fn write_local(&self, key: &str, entry: &CacheEntry, opts: &CacheEntryOptions) {
        if let Some(local) = &self.stack.local
            && let Err(e) = local.set(key, entry, opts.fallback_duration()).await
        {
            tracing::warn!(cache = %self.stack.name, key, error = %e, "failed to populate local tier");
        }
    }

    /// L2 read bounded by the hard timeout, with the suppression policy.
    async fn remote_entry(
        &self,
        key: &str,
        opts: &CacheEntryOptions,
    ) -> Result<Option<CacheEntry>> {
        match &self.stack.remote {
            Some(remote) => suppress(
                remote.get(key, &opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "get",
                Some(key),
            ),
            None => Ok(None),
        }
    }

    async fn read_entry(&self, key: &str, opts: &CacheEntryOptions) -> Result<Option<CacheEntry>> {
        let now = now_millis();
        let local = self.local_entry(key).await?;

        if let Some(entry) = local {
            match entry.state(now) {
                EntryState::Fresh => {
                    self.record_hit(key, Tier::Local, false);
                    return Ok(Some(entry));
                }
                EntryState::EarlyStale => {
                    self.record_hit(key, Tier::Local, false);
                    self.spawn_remote_refresh(key, opts, entry.logical_expire_at());
                    return Ok(Some(entry));
                }
                EntryState::GraceStale => {
                    if let Some(fresher) = self.remote_within_soft(key, opts).await {
                        self.write_local(key, &fresher, opts).await;
                        self.record_hit(key, Tier::Remote, false);
                        return Ok(Some(fresher));
                    }
                    self.record_hit(key, Tier::Local, true);
                    return Ok(Some(entry));
                }
                EntryState::Expired => {}
            }
        }

        match self.remote_entry(key, opts).await? {
            Some(entry) if entry.state(now).is_servable() => {
                self.write_local(key, &entry, opts).await;
                let graced = entry.state(now) == EntryState::GraceStale;
                self.record_hit(key, Tier::Remote, graced);
                Ok(Some(entry))
            }
            _ => {
                self.record_miss(key);
                Ok(None)
            }
        }
    }

    /// A valid L2 entry if one arrives within the soft timeout. Any failure
    /// is absorbed since the caller has a stale value to fall back on.
    async fn remote_within_soft(&self, key: &str, opts: &CacheEntryOptions) -> Option<CacheEntry> {
        let remote = self.stack.remote.as_ref()?;
        match remote.get_soft(key, &opts.timeouts).await {
            Ok(Some(entry)) if entry.state(now_millis()).is_valid() => Some(entry),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(cache = %self.stack.name, key, error = %e, "remote unavailable, serving grace value");
                None
            }
        }
    }

    /// Best L2 value for a caller that timed out on the lock with nothing
    /// usable in L1: a valid entry, or a stale one within the fallback window.
    async fn remote_fallback(&self, key: &str, opts: &CacheEntryOptions) -> Option<CacheEntry> {
        let remote = self.stack.remote.as_ref()?;
        let entry = match remote.get_soft(key, &opts.timeouts).await {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::debug!(cache = %self.stack.name, key, error = %e, "remote unavailable after lock timeout");
                return None;
            }
        };

        let now = now_millis();
        if entry.state(now).is_valid() {
            self.write_local(key, &entry, opts).await;
            self.record_hit(key, Tier::Remote, false);
            return Some(entry);
        }
        if entry.is_within_fallback(now, opts.fallback_duration()) {
            tracing::warn!(cache = %self.stack.name, key, "lock timeout, serving stale remote value");
            self.record_hit(key, Tier::Remote, true);
            return Some(entry);
        }
        None
    }

    /// Refreshes an early-stale L1 entry from L2 in the background.
    fn spawn_remote_refresh(&self, key: &str, opts: &CacheEntryOptions, current_logical: u64) {
        if self.stack.remote.is_none() {
            return;
        }
        let Some(lock) = self.stack.locks.try_acquire(&self.stack.lock_key(key)) else {
            return;
        };

        let cache = self.clone();
        let key = key.to_string();
        let opts = opts.clone();
        tokio::spawn(async move {
            let _lock = lock;
            match cache.remote_entry(&key, &opts).await {
                Ok(Some(entry))
                    if entry.logical_expire_at() > current_logical
                        && entry.state(now_millis()).is_valid() =>
                {
                    cache.write_local(&key, &entry, &opts).await;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(key = %key, error = %e, "background remote refresh failed"),
            }
        });
    }

    /// Recomputes an early-stale entry in the background, at most one
    /// refresh per key at a time.
    fn spawn_refresh<T, F, Fut, E>(&self, key: &str, opts: CacheEntryOptions, factory: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let Some(lock) = self.stack.locks.try_acquire(&self.stack.lock_key(key)) else {
            tracing::trace!(key, "refresh already in flight");
            return;
        };

        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(&key, &opts, factory, lock).await {
                tracing::warn!(cache = %cache.stack.name, key = %key, error = %e, "background refresh failed");
            }
        });
    }

    async fn refresh<T, F, Fut, E>(
        &self,
        key: &str,
        opts: &CacheEntryOptions,
        factory: F,
        _lock: LockHandle,
    ) -> Result<()>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(entry) = self.local_entry(key).await?
            && entry.state(now_millis()) == EntryState::Fresh
        {
            return Ok(());
        }

        let value = run_factory(factory).await.map_err(|e| CacheError::factory(key, e))?;
        let entry = opts.build_entry(serde_json::to_value(value)?, now_millis())?;
        self.write_through(key, &entry, opts).await
    }

    /// Synchronous recomputation under the per-key lock.
    async fn compute<T, F, Fut, E>(
        &self,
        key: &str,
        opts: &CacheEntryOptions,
        mut stale: Option<CacheEntry>,
        factory: F,
    ) -> Result<Value>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let fallback = opts.fallback_duration();
        let lock_key = self.stack.lock_key(key);

        let _lock = loop {
            match self.stack.locks.acquire(&lock_key, opts.lock_timeout).await {
                Ok(handle) => break handle,
                Err(e) => {
                    if let Some(entry) = stale
                        .as_ref()
                        .filter(|s| s.is_within_fallback(now_millis(), fallback))
                    {
                        tracing::warn!(cache = %self.stack.name, key, "lock timeout, serving stale value");
                        self.record_hit(key, Tier::Local, true);
                        return Ok(entry.value().clone());
                    }
                    if let Some(entry) = self.remote_fallback(key, opts).await {
                        return Ok(entry.into_value());
                    }
                    match opts.lock_timeout_behavior {
                        LockTimeoutBehavior::Fail => return Err(e),
                        LockTimeoutBehavior::Retry => {
                            tracing::debug!(cache = %self.stack.name, key, "lock timeout, retrying");
                        }
                    }
                }
            }
        };

        // Another holder may have refreshed the entry while we waited.
        let now = now_millis();
        if let Some(entry) = self.local_entry(key).await? {
            if entry.state(now).is_valid() {
                self.record_hit(key, Tier::Local, false);
                return Ok(entry.into_value());
            }
            stale = Some(entry);
        }

        if let Some(entry) = self.remote_entry(key, opts).await? {
            let state = entry.state(now);
            if state.is_valid() {
                self.write_local(key, &entry, opts).await;
                self.record_hit(key, Tier::Remote, false);
                return Ok(entry.into_value());
            }
            let newer = stale
                .as_ref()
                .is_none_or(|s| s.logical_expire_at() < entry.logical_expire_at());
            if state.is_servable() && newer {
                stale = Some(entry);
            }
        }

        self.record_miss(key);
        match run_factory(factory).await {
            Ok(value) => {
                let value = serde_json::to_value(value)?;
                let entry = opts.build_entry(value.clone(), now_millis())?;
                self.write_through(key, &entry, opts).await?;
                Ok(value)
            }
            Err(source) => {
                let now = now_millis();
                let graced = stale.filter(|s| {
                    opts.grace_period.enabled && s.state(now) == EntryState::GraceStale
                });
                let Some(entry) = graced else {
                    return Err(CacheError::factory(key, source));
                };

                tracing::warn!(
                    cache = %self.stack.name,
                    key,
                    error = %source,
                    "factory failed, serving grace value"
                );
                let extended = entry.with_fallback(now, fallback);
                self.write_local(key, &extended, opts).await;
                self.record_hit(key, Tier::Local, true);
                Ok(extended.into_value())
            }
        }
    }

    async fn write_through(
        &self,
        key: &str,
        entry: &CacheEntry,
        opts: &CacheEntryOptions,
    ) -> Result<()> {
        let fallback = opts.fallback_duration();

        if let Some(local) = &self.stack.local {
            local.set(key, entry, fallback).await?;
        }
        if let Some(remote) = &self.stack.remote {
            suppress(
                remote.set(key, entry, fallback, &opts.timeouts).await,
                opts.suppress_remote_cache_errors,
                "set",
                Some(key),
            )?;
        }

        if self.stack.bus().is_some() {
            let payload = self.stack.serializer.serialize(entry).ok();
            self.publish(InvalidationMessage::set(
                key,
                self.stack.namespace.clone(),
                self.origin_id(),
                payload,
            ));
        }

        tracing::debug!(cache = %self.stack.name, namespace = self.namespace_path(), key, "cache written");
        self.stack.emitter.emit(CacheEvent::Written {
            cache: self.stack.name.to_string(),
            key: key.to_string(),
            namespace: self.stack.namespace.clone(),
        });
        Ok(())
    }

    fn publish(&self, message: InvalidationMessage) {
        if let Some(bus) = self.stack.bus() {
            bus.send(message);
        }
    }

    fn record_hit(&self, key: &str, tier: Tier, graced: bool) {
        metrics::record_hit(tier);
        tracing::debug!(cache = %self.stack.name, key, tier = tier.as_str(), graced, "cache hit");
        self.stack.emitter.emit(CacheEvent::Hit {
            cache: self.stack.name.to_string(),
            key: key.to_string(),
            namespace: self.stack.namespace.clone(),
            tier,
            graced,
        });
    }

    fn record_miss(&self, key: &str) {
        metrics::record_miss();
        tracing::debug!(cache = %self.stack.name, key, "cache miss");
        self.stack.emitter.emit(CacheEvent::Miss {
            cache: self.stack.name.to_string(),
            key: key.to_string(),
            namespace: self.stack.namespace.clone(),
        });
    }

    fn emit_deleted(&self, key: &str) {
        self.stack.emitter.emit(CacheEvent::Deleted {
            cache: self.stack.name.to_string(),
            key: key.to_string(),
            namespace: self.stack.namespace.clone(),
        });
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.stack.name)
            .field("namespace", &self.stack.namespace)
            .field("local", &self.stack.local)
            .field("remote", &self.stack.remote)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

async fn run_factory<T, F, Fut, E>(factory: F) -> std::result::Result<T, BoxError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    let result = factory().await.map_err(Into::into);
    metrics::record_factory_call(result.is_ok());
    result
}
