//! Wiring of tiers, bus and defaults for one named cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tiercache_core::{
    BusTransport, CacheDriver, CacheEntryOptions, CacheError, CacheSerializer, DynDriver,
    EventEmitter, JsonSerializer, Result, Tier, join_namespace,
};

use crate::bus::{BusOptions, InvalidationBus};
use crate::cache::Cache;
use crate::lock::LockManager;
use crate::tier::{RemoteTier, TierFacade};

/// State shared by a cache and every namespace derived from it.
pub(crate) struct SharedState {
    disconnected: AtomicBool,
    root_local: Option<TierFacade>,
    root_remote: Option<TierFacade>,
    bus: Option<Arc<InvalidationBus>>,
}

impl SharedState {
    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Releases the bus and both drivers once; later calls are no-ops.
    pub(crate) async fn disconnect(&self, cache_name: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(bus) = &self.bus {
            bus.shutdown().await;
        }
        for facade in [&self.root_local, &self.root_remote].into_iter().flatten() {
            if let Err(e) = facade.disconnect().await {
                tracing::warn!(cache = cache_name, tier = facade.tier().as_str(), error = %e, "failed to disconnect driver");
            }
        }
        tracing::info!(cache = cache_name, "cache disconnected");
    }
}

/// One namespace level of a cache: tiers, defaults and shared plumbing.
pub(crate) struct CacheStack {
    pub(crate) name: Arc<str>,
    pub(crate) namespace: Option<String>,
    pub(crate) local: Option<TierFacade>,
    pub(crate) remote: Option<RemoteTier>,
    pub(crate) defaults: CacheEntryOptions,
    pub(crate) serializer: Arc<dyn CacheSerializer>,
    pub(crate) locks: LockManager,
    pub(crate) emitter: EventEmitter,
    pub(crate) shared: Arc<SharedState>,
}

impl CacheStack {
    pub(crate) fn bus(&self) -> Option<&Arc<InvalidationBus>> {
        self.shared.bus.as_ref()
    }

    /// Key used for locking, unique across namespaces of this cache.
    pub(crate) fn lock_key(&self, key: &str) -> String {
        join_namespace(self.namespace.as_deref(), key)
    }

    /// Derives the stack for a nested namespace.
    pub(crate) fn namespace(&self, namespace: &str) -> Self {
        Self {
            name: self.name.clone(),
            namespace: Some(join_namespace(self.namespace.as_deref(), namespace)),
            local: self.local.as_ref().map(|l| l.namespace(namespace)),
            remote: self.remote.as_ref().map(|r| r.namespace(namespace)),
            defaults: self.defaults.clone(),
            serializer: self.serializer.clone(),
            locks: self.locks.clone(),
            emitter: self.emitter.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Builder for a [`Cache`].
///
/// ```no_run
/// # async fn demo() -> tiercache_core::Result<()> {
/// use std::time::Duration;
/// use tiercache::{BusOptions, Cache, CacheEntryOptions};
/// use tiercache_memory::{MemoryBus, MemoryConfig, MemoryDriver};
///
/// let cache = Cache::builder("users")
///     .local(MemoryDriver::new(MemoryConfig::new().with_max_items(10_000)))
///     .bus(MemoryBus::new(), BusOptions::default())
///     .defaults(CacheEntryOptions::new().with_ttl(Duration::from_secs(60)))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CacheBuilder {
    name: String,
    local: Option<DynDriver>,
    remote: Option<DynDriver>,
    bus: Option<(Arc<dyn BusTransport>, BusOptions)>,
    defaults: CacheEntryOptions,
    serializer: Arc<dyn CacheSerializer>,
    emitter: Option<EventEmitter>,
}

impl CacheBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: None,
            remote: None,
            bus: None,
            defaults: CacheEntryOptions::default(),
            serializer: Arc::new(JsonSerializer),
            emitter: None,
        }
    }

    pub fn local(self, driver: impl CacheDriver + 'static) -> Self {
        self.local_driver(Arc::new(driver))
    }

    pub fn local_driver(mut self, driver: DynDriver) -> Self {
        self.local = Some(driver);
        self
    }

    pub fn remote(self, driver: impl CacheDriver + 'static) -> Self {
        self.remote_driver(Arc::new(driver))
    }

    pub fn remote_driver(mut self, driver: DynDriver) -> Self {
        self.remote = Some(driver);
        self
    }

    pub fn bus(self, transport: impl BusTransport + 'static, options: BusOptions) -> Self {
        self.bus_transport(Arc::new(transport), options)
    }

    pub fn bus_transport(mut self, transport: Arc<dyn BusTransport>, options: BusOptions) -> Self {
        self.bus = Some((transport, options));
        self
    }

    pub fn defaults(mut self, defaults: CacheEntryOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn CacheSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Event emitter to publish cache events on. A fresh one is created
    /// when none is given.
    pub fn emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub async fn build(self) -> Result<Cache> {
        if self.name.is_empty() {
            return Err(CacheError::configuration("cache name must not be empty"));
        }
        self.defaults.validate()?;

        let name: Arc<str> = Arc::from(self.name);
        let emitter = self.emitter.unwrap_or_default();
        let local = self
            .local
            .map(|driver| TierFacade::new(Tier::Local, driver, self.serializer.clone()));
        let remote = self
            .remote
            .map(|driver| TierFacade::new(Tier::Remote, driver, self.serializer.clone()));

        let bus = match (self.bus, &local) {
            (Some((transport, options)), Some(local)) => Some(
                InvalidationBus::start(
                    name.clone(),
                    transport,
                    options,
                    local.clone(),
                    self.defaults.fallback_duration(),
                    emitter.clone(),
                )
                .await?,
            ),
            (Some(_), None) => {
                tracing::warn!(cache = %name, "bus configured without a local tier, ignoring it");
                None
            }
            (None, _) => None,
        };

        tracing::debug!(
            cache = %name,
            local = local.as_ref().map(|l| l.driver().name()),
            remote = remote.as_ref().map(|r| r.driver().name()),
            bus = bus.is_some(),
            "cache built"
        );

        let shared = Arc::new(SharedState {
            disconnected: AtomicBool::new(false),
            root_local: local.clone(),
            root_remote: remote.clone(),
            bus,
        });

        Ok(Cache::from_stack(CacheStack {
            name,
            namespace: None,
            local,
            remote: remote.map(RemoteTier::new),
            defaults: self.defaults,
            serializer: self.serializer,
            locks: LockManager::new(),
            emitter,
            shared,
        }))
    }
}
