//! # tiercache-redis
//!
//! Redis implementations of the tiercache contracts:
//!
//! - [`RedisDriver`]: remote tier over a `deadpool-redis` pool
//! - [`RedisBus`]: invalidation bus over Redis pub/sub, reconnecting with
//!   exponential backoff
//!
//! Both are built from a [`RedisDriverConfig`].

pub mod bus;
pub mod driver;

pub use bus::RedisBus;
pub use driver::{RedisDriver, RedisDriverConfig};

use deadpool_redis::PoolError;
use tiercache_core::{DriverError, TransportError};

pub(crate) fn driver_error(err: redis::RedisError) -> DriverError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        DriverError::connection(err.to_string())
    } else {
        DriverError::command(err.to_string())
    }
}

pub(crate) fn pool_error(err: PoolError) -> DriverError {
    match err {
        PoolError::Closed => DriverError::Disconnected,
        other => DriverError::connection(other.to_string()),
    }
}

pub(crate) fn transport_pool_error(err: PoolError) -> TransportError {
    match err {
        PoolError::Closed => TransportError::Disconnected,
        other => TransportError::connection(other.to_string()),
    }
}
