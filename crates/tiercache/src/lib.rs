//! Multi-tier cache.
//!
//! A [`Cache`] stacks a fast in-process tier (L1) over a shared remote tier
//! (L2) and keeps the L1 of every instance coherent through an invalidation
//! bus. On top of plain get/set it offers:
//!
//! - `get_or_set` with per-key stampede protection: one factory call per key
//!   at a time, no matter how many callers miss together;
//! - early expiration: values are refreshed in the background before they
//!   expire while callers keep getting the cached value;
//! - grace periods: expired values are served when the factory or L2 fails;
//! - soft/hard timeouts on L2 and optional suppression of L2 errors;
//! - namespaces that can be cleared as a group.
//!
//! ```no_run
//! # async fn demo() -> tiercache::Result<()> {
//! use std::time::Duration;
//! use tiercache::{Cache, CacheEntryOptions, GracePeriod};
//! use tiercache_memory::MemoryDriver;
//!
//! let cache = Cache::builder("products")
//!     .local(MemoryDriver::default())
//!     .defaults(
//!         CacheEntryOptions::new()
//!             .with_ttl(Duration::from_secs(60))
//!             .with_grace_period(GracePeriod::enabled(Duration::from_secs(3600))),
//!     )
//!     .build()
//!     .await?;
//!
//! let name: String = cache
//!     .get_or_set("product:42", || async { Ok::<_, std::io::Error>("Widget".to_string()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod factory;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod observability;
pub mod tier;

mod stack;

pub use bus::{BusOptions, InvalidationBus, RetryQueue, RetryQueueOptions};
pub use cache::Cache;
pub use factory::{create_cache, create_cache_with_emitter};
pub use lock::{LockHandle, LockManager};
pub use manager::CacheManager;
pub use stack::CacheBuilder;

pub use tiercache_core::{
    BoxError, CacheEntry, CacheEntryOptions, CacheError, CacheEvent, EntryOptions, EntryState,
    ErrorCategory, EventEmitter, GracePeriod, LockTimeoutBehavior, Result, Tier, Timeouts,
};
