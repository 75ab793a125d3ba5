#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tiercache::{BusOptions, Cache, CacheEntryOptions, CacheEvent};
use tiercache_core::{CacheDriver, DriverError, DynDriver, KeyPrefix};
use tiercache_memory::{MemoryBus, MemoryBusHub, MemoryDriver};
use tokio::sync::broadcast;

/// Several cache instances sharing one "remote" store and one bus hub, the
/// way processes share Redis.
pub struct Cluster {
    pub hub: MemoryBusHub,
    pub remote: ChaosDriver,
}

pub struct Node {
    pub cache: Cache,
    pub bus: Arc<MemoryBus>,
    pub local: Arc<MemoryDriver>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            hub: MemoryBusHub::new(),
            remote: ChaosDriver::new(MemoryDriver::default()),
        }
    }

    pub async fn node(&self, name: &str, defaults: CacheEntryOptions) -> Node {
        self.node_with_bus(name, defaults, BusOptions::default()).await
    }

    pub async fn node_with_bus(
        &self,
        name: &str,
        defaults: CacheEntryOptions,
        bus_options: BusOptions,
    ) -> Node {
        let bus = Arc::new(self.hub.bus());
        let local = Arc::new(MemoryDriver::default());
        let cache = Cache::builder(name)
            .local_driver(local.clone())
            .remote(self.remote.clone())
            .bus_transport(bus.clone(), bus_options)
            .defaults(defaults)
            .build()
            .await
            .unwrap();
        Node { cache, bus, local }
    }
}

/// Local-only cache with the given defaults.
pub async fn local_cache(defaults: CacheEntryOptions) -> Cache {
    Cache::builder("local")
        .local(MemoryDriver::default())
        .defaults(defaults)
        .build()
        .await
        .unwrap()
}

/// Memory L1 over a chaos L2, no bus.
pub async fn chaos_cache(defaults: CacheEntryOptions) -> (Cache, ChaosDriver) {
    let remote = ChaosDriver::new(MemoryDriver::default());
    let cache = Cache::builder("chaos")
        .local(MemoryDriver::default())
        .remote(remote.clone())
        .defaults(defaults)
        .build()
        .await
        .unwrap();
    (cache, remote)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drains every event currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Counts factory invocations.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ChaosState {
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

/// Driver wrapper that can be made slow or failing at runtime.
#[derive(Clone)]
pub struct ChaosDriver {
    inner: DynDriver,
    state: Arc<ChaosState>,
}

impl ChaosDriver {
    pub fn new(inner: impl CacheDriver + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            state: Arc::default(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    /// Number of driver calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Direct access to the stored data, bypassing chaos.
    pub fn inner(&self) -> &DynDriver {
        &self.inner
    }

    async fn disturb(&self) -> Result<(), DriverError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(DriverError::connection("chaos: remote unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheDriver for ChaosDriver {
    fn name(&self) -> &'static str {
        "chaos"
    }

    fn prefix(&self) -> &KeyPrefix {
        self.inner.prefix()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DriverError> {
        self.disturb().await?;
        self.inner.get(key).await
    }

    async fn pull(&self, key: &str) -> Result<Option<String>, DriverError> {
        self.disturb().await?;
        self.inner.pull(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        self.disturb().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn has(&self, key: &str) -> Result<bool, DriverError> {
        self.disturb().await?;
        self.inner.has(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, DriverError> {
        self.disturb().await?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool, DriverError> {
        self.disturb().await?;
        self.inner.delete_many(keys).await
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.disturb().await?;
        self.inner.clear().await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, DriverError> {
        self.disturb().await?;
        self.inner.remaining_ttl(key).await
    }

    fn namespace(&self, namespace: &str) -> DynDriver {
        Arc::new(Self {
            inner: self.inner.namespace(namespace),
            state: self.state.clone(),
        })
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.inner.disconnect().await
    }
}
