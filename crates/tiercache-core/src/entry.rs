//! The cache entry envelope and its lifecycle.
//!
//! An entry carries its value together with three absolute timestamps
//! (epoch milliseconds):
//!
//! ```text
//!   write      early          logical          grace
//!     |--------|--------------|----------------|------------>
//!       Fresh     EarlyStale      GraceStale       Expired
//! ```
//!
//! `early_expire_at <= logical_expire_at <= grace_expire_at` always holds.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::time::{duration_millis, millis_until};

/// Lifecycle state of an entry relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Valid, no refresh needed.
    Fresh,
    /// Still valid, but a background refresh should be started.
    EarlyStale,
    /// Logically expired, may be served as a fallback.
    GraceStale,
    /// Must not be served.
    Expired,
}

impl EntryState {
    /// `true` for states whose value may be returned without recomputation.
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Fresh | Self::EarlyStale)
    }

    /// `true` for states whose value may be returned at all.
    pub fn is_servable(self) -> bool {
        !matches!(self, Self::Expired)
    }
}

/// A value stored in a cache tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    value: Value,
    logical_expire_at: u64,
    early_expire_at: Option<u64>,
    grace_expire_at: Option<u64>,
}

impl CacheEntry {
    /// Builds an entry, rejecting timestamps that violate the ordering invariant.
    pub fn new(
        value: Value,
        logical_expire_at: u64,
        early_expire_at: Option<u64>,
        grace_expire_at: Option<u64>,
    ) -> Result<Self> {
        if let Some(early) = early_expire_at
            && early > logical_expire_at
        {
            return Err(CacheError::decode(format!(
                "early expiration {early} is after logical expiration {logical_expire_at}"
            )));
        }
        if let Some(grace) = grace_expire_at
            && grace < logical_expire_at
        {
            return Err(CacheError::decode(format!(
                "grace expiration {grace} is before logical expiration {logical_expire_at}"
            )));
        }

        Ok(Self {
            value,
            logical_expire_at,
            early_expire_at,
            grace_expire_at,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Deserializes the stored value into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    pub fn logical_expire_at(&self) -> u64 {
        self.logical_expire_at
    }

    pub fn early_expire_at(&self) -> Option<u64> {
        self.early_expire_at
    }

    pub fn grace_expire_at(&self) -> Option<u64> {
        self.grace_expire_at
    }

    /// Evaluates the lifecycle state at `now`.
    pub fn state(&self, now: u64) -> EntryState {
        if now >= self.logical_expire_at {
            return match self.grace_expire_at {
                Some(grace) if now < grace => EntryState::GraceStale,
                _ => EntryState::Expired,
            };
        }

        match self.early_expire_at {
            Some(early) if now >= early => EntryState::EarlyStale,
            _ => EntryState::Fresh,
        }
    }

    /// Instant until which a tier should physically keep the entry.
    ///
    /// With a grace window the entry is kept one `fallback` past the grace
    /// deadline so that a caller who times out on the lock can still be
    /// served once.
    pub fn retain_until(&self, fallback: Duration) -> u64 {
        match self.grace_expire_at {
            Some(grace) => grace.saturating_add(duration_millis(fallback)),
            None => self.logical_expire_at,
        }
    }

    /// Physical TTL to hand to a driver, `None` when already past retention.
    pub fn physical_ttl(&self, now: u64, fallback: Duration) -> Option<Duration> {
        millis_until(now, self.retain_until(fallback))
    }

    /// `true` while the entry may be served after a lock timeout, which
    /// extends one `fallback` beyond the grace deadline.
    pub fn is_within_fallback(&self, now: u64, fallback: Duration) -> bool {
        match self.grace_expire_at {
            Some(_) => now < self.retain_until(fallback),
            None => false,
        }
    }

    /// Returns a copy whose logical expiration is pushed to `now + fallback`,
    /// capped at the grace deadline. Used after a failed refresh so that the
    /// stale value keeps being served without calling the factory again.
    pub fn with_fallback(&self, now: u64, fallback: Duration) -> Self {
        let extended = now.saturating_add(duration_millis(fallback));
        let logical = match self.grace_expire_at {
            Some(grace) => extended.min(grace),
            None => extended,
        };

        Self {
            value: self.value.clone(),
            logical_expire_at: logical.max(self.logical_expire_at),
            early_expire_at: None,
            grace_expire_at: self.grace_expire_at,
        }
    }
}
