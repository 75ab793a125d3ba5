//! Cache events and the broadcaster they are emitted on.
//!
//! Emission is fire-and-forget: with no subscriber the event is dropped, and
//! slow subscribers lose the oldest events instead of slowing the cache down.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::bus::MessageKind;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Tier an event relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "l1",
            Self::Remote => "l2",
        }
    }
}

/// Something observable that happened inside a cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit {
        cache: String,
        key: String,
        namespace: Option<String>,
        tier: Tier,
        /// The value was served from the grace window.
        graced: bool,
    },
    Miss {
        cache: String,
        key: String,
        namespace: Option<String>,
    },
    Written {
        cache: String,
        key: String,
        namespace: Option<String>,
    },
    Deleted {
        cache: String,
        key: String,
        namespace: Option<String>,
    },
    Cleared {
        cache: String,
        namespace: Option<String>,
    },
    BusMessagePublished {
        cache: String,
        kind: MessageKind,
        namespace: Option<String>,
    },
    BusMessageReceived {
        cache: String,
        kind: MessageKind,
        namespace: Option<String>,
    },
    BusPublishFailed {
        cache: String,
        kind: MessageKind,
        namespace: Option<String>,
        error: String,
    },
    /// The retry queue was full and its oldest message was dropped.
    RetryQueueOverflow {
        cache: String,
        dropped: MessageKind,
    },
}

impl CacheEvent {
    /// Stable event name, e.g. `cache:hit` or `bus:message:published`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hit { .. } => "cache:hit",
            Self::Miss { .. } => "cache:miss",
            Self::Written { .. } => "cache:written",
            Self::Deleted { .. } => "cache:deleted",
            Self::Cleared { .. } => "cache:cleared",
            Self::BusMessagePublished { .. } => "bus:message:published",
            Self::BusMessageReceived { .. } => "bus:message:received",
            Self::BusPublishFailed { .. } => "bus:message:failed",
            Self::RetryQueueOverflow { .. } => "bus:retry_queue:overflow",
        }
    }

    pub fn cache_name(&self) -> &str {
        match self {
            Self::Hit { cache, .. }
            | Self::Miss { cache, .. }
            | Self::Written { cache, .. }
            | Self::Deleted { cache, .. }
            | Self::Cleared { cache, .. }
            | Self::BusMessagePublished { cache, .. }
            | Self::BusMessageReceived { cache, .. }
            | Self::BusPublishFailed { cache, .. }
            | Self::RetryQueueOverflow { cache, .. } => cache,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Hit { key, .. }
            | Self::Miss { key, .. }
            | Self::Written { key, .. }
            | Self::Deleted { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Broadcaster for cache events.
///
/// Cheap to clone; all clones feed the same subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Emits an event, returning the number of subscribers that got it.
    pub fn emit(&self, event: CacheEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
