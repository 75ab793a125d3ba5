//! # tiercache-core
//!
//! Building blocks shared by every tiercache crate:
//!
//! - [`CacheEntry`] and its lifecycle ([`EntryState`])
//! - [`CacheEntryOptions`] / [`EntryOptions`] (defaults and per-call overrides)
//! - [`CacheSerializer`] with the default [`JsonSerializer`]
//! - The [`CacheDriver`] contract for storage tiers
//! - The [`BusTransport`] contract and [`InvalidationMessage`]
//! - [`CacheEvent`] and the [`EventEmitter`]
//! - The error taxonomy ([`CacheError`], [`DriverError`], [`TransportError`])
//!
//! Concrete drivers and transports live in `tiercache-memory` and
//! `tiercache-redis`; the orchestration lives in `tiercache`.

pub mod bus;
pub mod driver;
pub mod entry;
pub mod error;
pub mod events;
pub mod key;
pub mod options;
pub mod serializer;
pub mod time;

pub use bus::{BusTransport, InvalidationMessage, MessageKind, TransportEvent};
pub use driver::{CacheDriver, DynDriver, NoOpDriver};
pub use entry::{CacheEntry, EntryState};
pub use error::{BoxError, CacheError, DriverError, ErrorCategory, Result, TransportError};
pub use events::{CacheEvent, EventEmitter, Tier};
pub use key::{KeyPrefix, join_namespace};
pub use options::{CacheEntryOptions, EntryOptions, GracePeriod, LockTimeoutBehavior, Timeouts};
pub use serializer::{CacheSerializer, JsonSerializer};
pub use crate::time::now_millis;
