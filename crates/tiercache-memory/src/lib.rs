//! # tiercache-memory
//!
//! In-process implementations of the tiercache contracts:
//!
//! - [`MemoryDriver`]: bounded LRU store with per-entry TTL, usable as the
//!   local tier (or as a stand-in remote tier in tests)
//! - [`MemoryBus`]: bus transport whose endpoints share a [`MemoryBusHub`]

pub mod bus;
pub mod driver;

pub use bus::{MemoryBus, MemoryBusHub};
pub use driver::{MemoryConfig, MemoryDriver};
