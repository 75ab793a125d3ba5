//! In-process bus transport.
//!
//! Every [`MemoryBus`] created from the same [`MemoryBusHub`] sees the
//! messages of its siblings, which makes it possible to run several cache
//! instances inside one test process. A bus can be taken offline to
//! simulate an outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tiercache_core::{BusTransport, InvalidationMessage, TransportError, TransportEvent};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    bus_id: Uuid,
    online: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

/// Shared channel registry connecting [`MemoryBus`] instances.
#[derive(Clone, Default)]
pub struct MemoryBusHub {
    channels: Arc<DashMap<String, Vec<Subscriber>>>,
}

impl MemoryBusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus attached to this hub.
    pub fn bus(&self) -> MemoryBus {
        MemoryBus {
            id: Uuid::new_v4(),
            hub: self.clone(),
            online: Arc::new(AtomicBool::new(true)),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, channel: &str, message: &InvalidationMessage) {
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|s| !s.sender.is_closed());
            for subscriber in subscribers.iter() {
                if subscriber.online.load(Ordering::Acquire) {
                    let _ = subscriber
                        .sender
                        .send(TransportEvent::Message(message.clone()));
                }
            }
        }
    }

    fn notify_reconnected(&self, bus_id: Uuid) {
        for entry in self.channels.iter() {
            for subscriber in entry.value().iter().filter(|s| s.bus_id == bus_id) {
                let _ = subscriber.sender.send(TransportEvent::Reconnected);
            }
        }
    }

    fn remove_bus(&self, bus_id: Uuid) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().retain(|s| s.bus_id != bus_id);
        }
    }
}

impl std::fmt::Debug for MemoryBusHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBusHub")
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// A bus endpoint on a [`MemoryBusHub`].
#[derive(Clone)]
pub struct MemoryBus {
    id: Uuid,
    hub: MemoryBusHub,
    online: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl MemoryBus {
    /// Standalone bus with its own private hub.
    pub fn new() -> Self {
        MemoryBusHub::new().bus()
    }

    pub fn hub(&self) -> &MemoryBusHub {
        &self.hub
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Takes the bus offline or brings it back.
    ///
    /// While offline, publishing fails and incoming messages are lost. Coming
    /// back online emits [`TransportEvent::Reconnected`] to this bus's
    /// subscribers.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            tracing::debug!(bus = %self.id, "memory bus back online");
            self.hub.notify_reconnected(self.id);
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(
        &self,
        channel: &str,
        message: &InvalidationMessage,
    ) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        if !self.is_online() {
            return Err(TransportError::publish("memory bus is offline"));
        }
        self.hub.deliver(channel, message);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.hub
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                bus_id: self.id,
                online: self.online.clone(),
                sender,
            });
        Ok(receiver)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.hub.remove_bus(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(key: &str, origin: &str) -> InvalidationMessage {
        InvalidationMessage::delete(vec![key.to_string()], None, origin)
    }

    #[tokio::test]
    async fn test_siblings_receive_messages() {
        let hub = MemoryBusHub::new();
        let a = hub.bus();
        let b = hub.bus();

        let mut rx_b = b.subscribe("chan").await.unwrap();
        a.publish("chan", &delete("k", "a")).await.unwrap();

        match rx_b.recv().await.unwrap() {
            TransportEvent::Message(message) => assert_eq!(message.keys, vec!["k"]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_bus_fails_publish_and_misses_messages() {
        let hub = MemoryBusHub::new();
        let a = hub.bus();
        let b = hub.bus();
        let mut rx_b = b.subscribe("chan").await.unwrap();

        a.set_online(false);
        assert!(a.publish("chan", &delete("k", "a")).await.is_err());

        b.set_online(false);
        hub.bus().publish("chan", &delete("k", "c")).await.unwrap();
        b.set_online(true);

        assert_eq!(rx_b.recv().await.unwrap(), TransportEvent::Reconnected);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let hub = MemoryBusHub::new();
        let a = hub.bus();
        let _rx = a.subscribe("chan").await.unwrap();
        assert_eq!(hub.subscriber_count("chan"), 1);

        a.disconnect().await.unwrap();
        assert_eq!(hub.subscriber_count("chan"), 0);
        assert!(matches!(
            a.publish("chan", &delete("k", "a")).await,
            Err(TransportError::Disconnected)
        ));
    }
}
