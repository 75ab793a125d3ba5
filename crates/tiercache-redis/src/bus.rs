//! Redis pub/sub transport for the invalidation bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tiercache_core::{BusTransport, InvalidationMessage, TransportError, TransportEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport_pool_error;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bus transport publishing through a pooled connection and subscribing on a
/// dedicated pub/sub connection per channel.
#[derive(Clone)]
pub struct RedisBus {
    pool: Pool,
    url: Arc<str>,
    shutdown: CancellationToken,
}

impl RedisBus {
    pub fn new(pool: Pool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: Arc::from(url.into()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscription loop: (re)connects with exponential backoff until the
    /// receiver is dropped or the bus is disconnected.
    async fn run_subscription(
        client: redis::Client,
        channel: String,
        sender: mpsc::UnboundedSender<TransportEvent>,
        shutdown: CancellationToken,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        let mut connected_before = false;

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return,
                outcome = Self::listen(&client, &channel, &sender, &mut connected_before) => outcome,
            };

            if sender.is_closed() {
                return;
            }

            match outcome {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "bus subscription lost, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn listen(
        client: &redis::Client,
        channel: &str,
        sender: &mpsc::UnboundedSender<TransportEvent>,
        connected_before: &mut bool,
    ) -> Result<(), TransportError> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| TransportError::subscribe(e.to_string()))?;

        tracing::info!(channel, "subscribed to bus channel");
        if *connected_before {
            let _ = sender.send(TransportEvent::Reconnected);
        }
        *connected_before = true;

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(channel, error = %e, "unreadable bus payload");
                    continue;
                }
            };
            match InvalidationMessage::from_json(&payload) {
                Ok(message) => {
                    if sender.send(TransportEvent::Message(message)).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => tracing::warn!(channel, error = %e, "ignoring malformed bus message"),
            }
        }

        Err(TransportError::connection("pub/sub connection closed"))
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").field("url", &self.url).finish()
    }
}

#[async_trait]
impl BusTransport for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(
        &self,
        channel: &str,
        message: &InvalidationMessage,
    ) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        let payload = message.to_json()?;
        let mut conn = self.pool.get().await.map_err(transport_pool_error)?;
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| TransportError::publish(e.to_string()))?;
        tracing::trace!(channel, kind = %message.kind, "published bus message");
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        let client = redis::Client::open(self.url.as_ref())
            .map_err(|e| TransportError::connection(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_subscription(
            client,
            channel.to_string(),
            sender,
            self.shutdown.child_token(),
        ));
        Ok(receiver)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedisDriverConfig;

    #[tokio::test]
    async fn test_publish_after_disconnect_fails() {
        let config = RedisDriverConfig::new("redis://127.0.0.1:1");
        let bus = RedisBus::new(config.create_pool().unwrap(), config.url.clone());
        bus.disconnect().await.unwrap();

        let message = InvalidationMessage::clear(None, "node");
        assert!(matches!(
            bus.publish("chan", &message).await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            bus.subscribe("chan").await,
            Err(TransportError::Disconnected)
        ));
    }
}
