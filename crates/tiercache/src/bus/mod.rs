//! Cross-instance invalidation.
//!
//! Every mutation performed through a cache is published on the bus; the
//! sibling instances subscribed to the same channel mirror it into their
//! own local tier. Publishing never blocks or fails the caller: messages are
//! handed to a publisher task, and those whose publish fails or times out go
//! to a bounded [`RetryQueue`] that is drained periodically and whenever the
//! transport reports a reconnect.
//!
//! ```text
//! instance A: cache.delete("k")
//!   -> L1/L2 delete, PUBLISH tiercache:<name> {"keys":["k"],"kind":"delete",...}
//! instance B: subscriber receives message (origin != B) -> L1 delete "k"
//! ```

pub mod retry_queue;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tiercache_core::{
    BusTransport, CacheEvent, EventEmitter, InvalidationMessage, MessageKind, TransportError,
    TransportEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics;
use crate::tier::TierFacade;

pub use retry_queue::RetryQueue;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_QUEUE_SIZE: usize = 1000;
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryQueueOptions {
    pub enabled: bool,
    /// `None` leaves the queue unbounded; `Some(0)` disables it.
    pub max_size: Option<usize>,
}

impl Default for RetryQueueOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: Some(DEFAULT_RETRY_QUEUE_SIZE),
        }
    }
}

/// Bus settings for one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    /// Defaults to `tiercache:<cache name>`.
    pub channel: Option<String>,
    pub retry_queue: RetryQueueOptions,
    /// How often queued messages are retried.
    pub retry_interval: Duration,
    /// A publish still pending after this long counts as failed.
    pub publish_timeout: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            channel: None,
            retry_queue: RetryQueueOptions::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl BusOptions {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_retry_queue(mut self, retry_queue: RetryQueueOptions) -> Self {
        self.retry_queue = retry_queue;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

impl From<&tiercache_config::BusSection> for BusOptions {
    fn from(section: &tiercache_config::BusSection) -> Self {
        Self {
            channel: None,
            retry_queue: RetryQueueOptions {
                enabled: section.retry_queue.enabled,
                max_size: section.retry_queue.max_size,
            },
            retry_interval: Duration::from_millis(section.retry_interval_ms),
            publish_timeout: Duration::from_millis(section.publish_timeout_ms),
        }
    }
}

/// Invalidation bus of one cache (all its namespaces share it).
pub struct InvalidationBus {
    cache_name: Arc<str>,
    channel: String,
    origin_id: String,
    transport: Arc<dyn BusTransport>,
    publish_timeout: Duration,
    /// Feeds the publisher task.
    outgoing: mpsc::UnboundedSender<InvalidationMessage>,
    retry_queue: Option<RetryQueue>,
    /// Root (un-namespaced) local tier that incoming messages are applied to.
    local: TierFacade,
    fallback: Duration,
    emitter: EventEmitter,
    shutdown: CancellationToken,
}

impl InvalidationBus {
    /// Subscribes to the cache's channel and starts the background tasks:
    /// one publishes outgoing messages in order, the other applies incoming
    /// messages and drains the retry queue.
    pub async fn start(
        cache_name: Arc<str>,
        transport: Arc<dyn BusTransport>,
        options: BusOptions,
        local: TierFacade,
        fallback: Duration,
        emitter: EventEmitter,
    ) -> tiercache_core::Result<Arc<Self>> {
        let channel = options
            .channel
            .clone()
            .unwrap_or_else(|| format!("tiercache:{cache_name}"));
        let retry_queue = &options.retry_queue;
        let (outgoing, outbox) = mpsc::unbounded_channel();

        let bus = Arc::new(Self {
            cache_name,
            channel,
            origin_id: Uuid::new_v4().to_string(),
            transport,
            publish_timeout: options.publish_timeout,
            outgoing,
            retry_queue: (retry_queue.enabled && retry_queue.max_size != Some(0))
                .then(|| RetryQueue::new(retry_queue.max_size)),
            local,
            fallback,
            emitter,
            shutdown: CancellationToken::new(),
        });

        let events = bus.transport.subscribe(&bus.channel).await?;
        tracing::info!(
            cache = %bus.cache_name,
            channel = %bus.channel,
            transport = bus.transport.name(),
            "invalidation bus subscribed"
        );

        tokio::spawn(Self::run(
            Arc::downgrade(&bus),
            events,
            options.retry_interval,
            bus.shutdown.clone(),
        ));
        tokio::spawn(Self::run_publisher(
            Arc::downgrade(&bus),
            outbox,
            bus.shutdown.clone(),
        ));

        Ok(bus)
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.as_ref().map_or(0, RetryQueue::len)
    }

    /// Queues `message` for the publisher task and returns immediately.
    pub fn send(&self, message: InvalidationMessage) {
        if let Err(mpsc::error::SendError(message)) = self.outgoing.send(message) {
            // Publisher stopped; keep the message for a later drain.
            self.enqueue(message);
        }
    }

    /// Publishes `message`, queueing it for retry on failure.
    ///
    /// While older messages are waiting for a retry, `message` is queued
    /// behind them so siblings see mutations in order.
    pub async fn publish(&self, message: InvalidationMessage) {
        if self.retry_queue_len() > 0 {
            self.enqueue(message);
            self.drain_retry_queue().await;
            return;
        }

        let kind = message.kind;
        let namespace = message.namespace.clone();

        match self.publish_bounded(&message).await {
            Ok(()) => {
                metrics::record_bus_message("published", "ok", kind);
                self.emitter.emit(CacheEvent::BusMessagePublished {
                    cache: self.cache_name.to_string(),
                    kind,
                    namespace,
                });
            }
            Err(e) => {
                tracing::warn!(
                    cache = %self.cache_name,
                    kind = %kind,
                    error = %e,
                    "failed to publish invalidation"
                );
                metrics::record_bus_message("published", "failed", kind);
                self.emitter.emit(CacheEvent::BusPublishFailed {
                    cache: self.cache_name.to_string(),
                    kind,
                    namespace,
                    error: e.to_string(),
                });
                self.enqueue(message);
            }
        }
    }

    /// Retries queued messages in order, stopping at the first failure.
    ///
    /// Returns how many messages were published.
    pub async fn drain_retry_queue(&self) -> usize {
        let Some(queue) = &self.retry_queue else {
            return 0;
        };

        let mut published = 0;
        while let Some(message) = queue.front() {
            if let Err(e) = self.publish_bounded(&message).await {
                tracing::debug!(cache = %self.cache_name, error = %e, remaining = queue.len(), "retry publish failed");
                break;
            }
            metrics::record_bus_message("published", "retried", message.kind);
            queue.remove_front(&message);
            published += 1;
        }

        metrics::set_retry_queue_size(&self.cache_name, queue.len());
        if published > 0 {
            tracing::info!(cache = %self.cache_name, published, remaining = queue.len(), "drained invalidation retry queue");
        }
        published
    }

    /// Stops the background tasks and releases the transport. Messages not
    /// yet handed to the transport are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(cache = %self.cache_name, error = %e, "failed to disconnect bus transport");
        }
    }

    async fn publish_bounded(&self, message: &InvalidationMessage) -> Result<(), TransportError> {
        tokio::time::timeout(
            self.publish_timeout,
            self.transport.publish(&self.channel, message),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::publish(format!(
                "publish timed out after {:?}",
                self.publish_timeout
            )))
        })
    }

    fn enqueue(&self, message: InvalidationMessage) {
        let Some(queue) = &self.retry_queue else {
            return;
        };

        if let Some(dropped) = queue.enqueue(message) {
            tracing::warn!(
                cache = %self.cache_name,
                kind = %dropped.kind,
                max_size = queue.max_size(),
                "retry queue full, dropped oldest invalidation"
            );
            metrics::record_bus_message("published", "dropped", dropped.kind);
            self.emitter.emit(CacheEvent::RetryQueueOverflow {
                cache: self.cache_name.to_string(),
                dropped: dropped.kind,
            });
        }
        metrics::set_retry_queue_size(&self.cache_name, queue.len());
    }

    async fn run_publisher(
        bus: Weak<Self>,
        mut outbox: mpsc::UnboundedReceiver<InvalidationMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = outbox.recv() => {
                    let Some(message) = message else { break };
                    let Some(bus) = bus.upgrade() else { break };
                    bus.publish(message).await;
                }
            }
        }
    }

    async fn run(
        bus: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(bus) = bus.upgrade() else { break };
                    match event {
                        TransportEvent::Message(message) => bus.handle(message).await,
                        TransportEvent::Reconnected => {
                            tracing::info!(cache = %bus.cache_name, "bus transport reconnected");
                            bus.drain_retry_queue().await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let Some(bus) = bus.upgrade() else { break };
                    if bus.retry_queue_len() > 0 {
                        bus.drain_retry_queue().await;
                    }
                }
            }
        }

        tracing::debug!("invalidation bus task stopped");
    }

    async fn handle(&self, message: InvalidationMessage) {
        if message.origin_id == self.origin_id {
            return;
        }

        let kind = message.kind;
        let namespace = message.namespace.clone();
        let target = match &message.namespace {
            Some(ns) => self.local.namespace(ns),
            None => self.local.clone(),
        };

        let result = match (kind, message.payload) {
            (MessageKind::Set, Some(payload)) => {
                self.apply_set(&target, &message.keys, &payload).await
            }
            (MessageKind::Set | MessageKind::Delete, _) => {
                target.delete_many(&message.keys).await.map(|_| ())
            }
            (MessageKind::Clear, _) => target.clear().await,
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    cache = %self.cache_name,
                    kind = %kind,
                    namespace = namespace.as_deref(),
                    keys = message.keys.len(),
                    "applied invalidation"
                );
                metrics::record_bus_message("received", "ok", kind);
                self.emitter.emit(CacheEvent::BusMessageReceived {
                    cache: self.cache_name.to_string(),
                    kind,
                    namespace,
                });
            }
            Err(e) => {
                tracing::warn!(cache = %self.cache_name, kind = %kind, error = %e, "failed to apply invalidation");
                metrics::record_bus_message("received", "failed", kind);
            }
        }
    }

    /// Stores the carried envelope; an undecodable payload invalidates instead.
    async fn apply_set(
        &self,
        target: &TierFacade,
        keys: &[String],
        payload: &str,
    ) -> tiercache_core::Result<()> {
        match target.serializer().deserialize(payload) {
            Ok(entry) => {
                for key in keys {
                    target.set(key, &entry, self.fallback).await?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(cache = %self.cache_name, error = %e, "undecodable set payload, invalidating");
                target.delete_many(keys).await.map(|_| ())
            }
        }
    }
}

impl std::fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationBus")
            .field("cache", &self.cache_name)
            .field("channel", &self.channel)
            .field("origin_id", &self.origin_id)
            .field("retry_queue_len", &self.retry_queue_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiercache_core::{CacheEntry, CacheSerializer, JsonSerializer, Tier, now_millis};
    use tiercache_memory::{MemoryBusHub, MemoryDriver};

    fn local() -> TierFacade {
        TierFacade::new(
            Tier::Local,
            Arc::new(MemoryDriver::default()),
            Arc::new(JsonSerializer),
        )
    }

    async fn start(
        transport: Arc<dyn BusTransport>,
        options: BusOptions,
        local: TierFacade,
    ) -> Arc<InvalidationBus> {
        InvalidationBus::start(
            Arc::from("test"),
            transport,
            options,
            local,
            Duration::ZERO,
            EventEmitter::new(),
        )
        .await
        .unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_delete_applied_on_sibling_not_on_origin() {
        let hub = MemoryBusHub::new();
        let local_a = local();
        let local_b = local();
        let entry = CacheEntry::new(json!(1), now_millis() + 60_000, None, None).unwrap();
        local_a.set("k", &entry, Duration::ZERO).await.unwrap();
        local_b.set("k", &entry, Duration::ZERO).await.unwrap();

        let bus_a = start(Arc::new(hub.bus()), BusOptions::default(), local_a.clone()).await;
        let _bus_b = start(Arc::new(hub.bus()), BusOptions::default(), local_b.clone()).await;

        bus_a
            .publish(InvalidationMessage::delete(
                vec!["k".into()],
                None,
                bus_a.origin_id(),
            ))
            .await;

        eventually(|| {
            let local_b = local_b.clone();
            async move { !local_b.has("k").await.unwrap() }
        })
        .await;
        assert!(local_a.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_payload_is_stored_in_namespace() {
        let hub = MemoryBusHub::new();
        let local_b = local();
        let bus_a = start(Arc::new(hub.bus()), BusOptions::default(), local()).await;
        let _bus_b = start(Arc::new(hub.bus()), BusOptions::default(), local_b.clone()).await;

        let entry = CacheEntry::new(json!("fresh"), now_millis() + 60_000, None, None).unwrap();
        let payload = JsonSerializer.serialize(&entry).unwrap();
        bus_a
            .publish(InvalidationMessage::set(
                "k",
                Some("users".into()),
                bus_a.origin_id(),
                Some(payload),
            ))
            .await;

        let users = local_b.namespace("users");
        eventually(|| {
            let users = users.clone();
            async move { users.has("k").await.unwrap() }
        })
        .await;
        assert_eq!(users.get("k").await.unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_after_reconnect() {
        let hub = MemoryBusHub::new();
        let transport = hub.bus();
        let bus = start(
            Arc::new(transport.clone()),
            BusOptions::default().with_retry_interval(Duration::from_secs(3600)),
            local(),
        )
        .await;

        transport.set_online(false);
        for key in ["a", "b"] {
            bus.publish(InvalidationMessage::delete(
                vec![key.into()],
                None,
                bus.origin_id(),
            ))
            .await;
        }
        assert_eq!(bus.retry_queue_len(), 2);

        transport.set_online(true);
        eventually(|| {
            let bus = bus.clone();
            async move { bus.retry_queue_len() == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_retry_queue_is_bounded() {
        let hub = MemoryBusHub::new();
        let transport = hub.bus();
        let emitter = EventEmitter::new();
        let mut events = emitter.subscribe();
        let bus = InvalidationBus::start(
            Arc::from("bounded"),
            Arc::new(transport.clone()),
            BusOptions::default().with_retry_queue(RetryQueueOptions {
                enabled: true,
                max_size: Some(3),
            }),
            local(),
            Duration::ZERO,
            emitter,
        )
        .await
        .unwrap();

        transport.set_online(false);
        for i in 0..4 {
            bus.publish(InvalidationMessage::delete(
                vec![format!("k{i}")],
                None,
                bus.origin_id(),
            ))
            .await;
        }
        assert_eq!(bus.retry_queue_len(), 3);

        let mut overflowed = false;
        while let Ok(event) = events.try_recv() {
            overflowed |= matches!(event, CacheEvent::RetryQueueOverflow { .. });
        }
        assert!(overflowed);
    }

    #[tokio::test]
    async fn test_disabled_retry_queue_drops_failures() {
        let hub = MemoryBusHub::new();
        let transport = hub.bus();
        let bus = start(
            Arc::new(transport.clone()),
            BusOptions::default().with_retry_queue(RetryQueueOptions {
                enabled: false,
                max_size: None,
            }),
            local(),
        )
        .await;

        transport.set_online(false);
        bus.publish(InvalidationMessage::clear(None, bus.origin_id()))
            .await;
        assert_eq!(bus.retry_queue_len(), 0);
    }
}
