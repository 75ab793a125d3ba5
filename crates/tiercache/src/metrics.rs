//! Cache metrics recorded through the `metrics` facade.
//!
//! Nothing is exported from here; the host process installs whatever
//! recorder it wants (Prometheus, StatsD, ...). Without a recorder every
//! call is a no-op.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tiercache_core::{MessageKind, Tier};

/// Metric names as constants for consistency.
pub mod names {
    pub const HITS_TOTAL: &str = "tiercache_hits_total";
    pub const MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const TIER_OPERATION_DURATION_SECONDS: &str = "tiercache_tier_operation_duration_seconds";
    pub const BUS_MESSAGES_TOTAL: &str = "tiercache_bus_messages_total";
    pub const RETRY_QUEUE_SIZE: &str = "tiercache_retry_queue_size";
    pub const FACTORY_CALLS_TOTAL: &str = "tiercache_factory_calls_total";
}

pub fn record_hit(tier: Tier) {
    counter!(names::HITS_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn record_miss() {
    counter!(names::MISSES_TOTAL).increment(1);
}

/// Record the duration and outcome of a driver call made by a tier facade.
pub fn record_tier_operation(tier: Tier, operation: &'static str, ok: bool, duration: Duration) {
    histogram!(
        names::TIER_OPERATION_DURATION_SECONDS,
        "tier" => tier.as_str(),
        "operation" => operation,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .record(duration.as_secs_f64());
}

/// `direction` is `published` or `received`; `status` is `ok`, `failed`,
/// `retried` or `dropped`.
pub fn record_bus_message(direction: &'static str, status: &'static str, kind: MessageKind) {
    counter!(
        names::BUS_MESSAGES_TOTAL,
        "direction" => direction,
        "status" => status,
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn set_retry_queue_size(cache: &str, size: usize) {
    gauge!(names::RETRY_QUEUE_SIZE, "cache" => cache.to_string()).set(size as f64);
}

pub fn record_factory_call(ok: bool) {
    counter!(
        names::FACTORY_CALLS_TOTAL,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}
