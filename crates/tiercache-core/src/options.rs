//! Entry options: stack-level defaults and per-call overrides.
//!
//! [`CacheEntryOptions`] is the fully resolved set used by one operation.
//! [`EntryOptions`] holds partial overrides; [`CacheEntryOptions::merge`]
//! applies them on top of the defaults (later overrides win).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::time::duration_millis;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_GRACE_DURATION: Duration = Duration::from_secs(6 * 60 * 60);
const DEFAULT_FALLBACK_DURATION: Duration = Duration::from_secs(10);

/// Grace period settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriod {
    pub enabled: bool,
    /// How long past the TTL a stale value may still be served.
    pub duration: Duration,
    /// How long a stale value is considered valid again after a failed refresh.
    pub fallback_duration: Duration,
}

impl GracePeriod {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            duration: DEFAULT_GRACE_DURATION,
            fallback_duration: DEFAULT_FALLBACK_DURATION,
        }
    }

    pub fn enabled(duration: Duration) -> Self {
        Self {
            enabled: true,
            duration,
            fallback_duration: DEFAULT_FALLBACK_DURATION,
        }
    }

    pub fn with_fallback_duration(mut self, fallback_duration: Duration) -> Self {
        self.fallback_duration = fallback_duration;
        self
    }
}

impl Default for GracePeriod {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Bounds on remote tier latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    /// Wait before falling back to a stale or local-only result.
    pub soft: Option<Duration>,
    /// Wait before treating the remote tier as failed.
    pub hard: Option<Duration>,
}

impl Timeouts {
    pub fn new(soft: Option<Duration>, hard: Option<Duration>) -> Self {
        Self { soft, hard }
    }

    /// Soft bound, falling back to the hard bound when unset.
    pub fn soft_or_hard(&self) -> Option<Duration> {
        self.soft.or(self.hard)
    }
}

/// What `get_or_set` does when the lock times out and nothing stale is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockTimeoutBehavior {
    /// Return a lock timeout error.
    #[default]
    Fail,
    /// Keep waiting for the lock, one timeout period at a time.
    Retry,
}

/// Resolved options for a single cache operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryOptions {
    pub ttl: Duration,
    pub grace_period: GracePeriod,
    /// Fraction of the TTL (exclusive 0..1) after which a refresh starts.
    pub early_expiration: Option<f64>,
    /// `None` waits for the lock indefinitely.
    pub lock_timeout: Option<Duration>,
    pub lock_timeout_behavior: LockTimeoutBehavior,
    pub timeouts: Timeouts,
    pub suppress_remote_cache_errors: bool,
}

impl Default for CacheEntryOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            grace_period: GracePeriod::disabled(),
            early_expiration: None,
            lock_timeout: None,
            lock_timeout_behavior: LockTimeoutBehavior::Fail,
            timeouts: Timeouts::default(),
            suppress_remote_cache_errors: true,
        }
    }
}

impl CacheEntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_grace_period(mut self, grace_period: GracePeriod) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_early_expiration(mut self, fraction: f64) -> Self {
        self.early_expiration = Some(fraction);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_lock_timeout_behavior(mut self, behavior: LockTimeoutBehavior) -> Self {
        self.lock_timeout_behavior = behavior;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_suppress_remote_cache_errors(mut self, suppress: bool) -> Self {
        self.suppress_remote_cache_errors = suppress;
        self
    }

    /// Checks that the options describe a consistent entry lifecycle.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(CacheError::configuration("ttl must be > 0"));
        }
        if let Some(fraction) = self.early_expiration
            && !(fraction > 0.0 && fraction < 1.0)
        {
            return Err(CacheError::configuration(format!(
                "early_expiration must be between 0 and 1 (exclusive), got {fraction}"
            )));
        }
        if let (Some(soft), Some(hard)) = (self.timeouts.soft, self.timeouts.hard)
            && hard < soft
        {
            return Err(CacheError::configuration(
                "timeouts.hard must be >= timeouts.soft",
            ));
        }
        Ok(())
    }

    /// Applies per-call overrides, returning validated options.
    pub fn merge(&self, overrides: &EntryOptions) -> Result<Self> {
        let mut merged = self.clone();
        if let Some(ttl) = overrides.ttl {
            merged.ttl = ttl;
        }
        if let Some(grace) = overrides.grace_period {
            merged.grace_period = grace;
        }
        if let Some(early) = overrides.early_expiration {
            merged.early_expiration = early;
        }
        if let Some(lock_timeout) = overrides.lock_timeout {
            merged.lock_timeout = lock_timeout;
        }
        if let Some(behavior) = overrides.lock_timeout_behavior {
            merged.lock_timeout_behavior = behavior;
        }
        if let Some(soft) = overrides.soft_timeout {
            merged.timeouts.soft = soft;
        }
        if let Some(hard) = overrides.hard_timeout {
            merged.timeouts.hard = hard;
        }
        if let Some(suppress) = overrides.suppress_remote_cache_errors {
            merged.suppress_remote_cache_errors = suppress;
        }
        merged.validate()?;
        Ok(merged)
    }

    /// Fallback window granted to stale values, zero when grace is disabled.
    pub fn fallback_duration(&self) -> Duration {
        if self.grace_period.enabled {
            self.grace_period.fallback_duration
        } else {
            Duration::ZERO
        }
    }

    /// Builds a new entry for `value` written at `now`.
    pub fn build_entry(&self, value: Value, now: u64) -> Result<CacheEntry> {
        let ttl_ms = duration_millis(self.ttl);
        let logical = now.saturating_add(ttl_ms);
        let early = self
            .early_expiration
            .map(|fraction| now.saturating_add((ttl_ms as f64 * fraction) as u64));
        let grace = self
            .grace_period
            .enabled
            .then(|| logical.saturating_add(duration_millis(self.grace_period.duration)));

        CacheEntry::new(value, logical, early, grace)
    }
}

/// Per-call overrides; unset fields keep the stack defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryOptions {
    pub ttl: Option<Duration>,
    pub grace_period: Option<GracePeriod>,
    pub early_expiration: Option<Option<f64>>,
    pub lock_timeout: Option<Option<Duration>>,
    pub lock_timeout_behavior: Option<LockTimeoutBehavior>,
    pub soft_timeout: Option<Option<Duration>>,
    pub hard_timeout: Option<Option<Duration>>,
    pub suppress_remote_cache_errors: Option<bool>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn grace_period(mut self, grace_period: GracePeriod) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    pub fn early_expiration(mut self, fraction: f64) -> Self {
        self.early_expiration = Some(Some(fraction));
        self
    }

    pub fn no_early_expiration(mut self) -> Self {
        self.early_expiration = Some(None);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(Some(timeout));
        self
    }

    pub fn lock_timeout_behavior(mut self, behavior: LockTimeoutBehavior) -> Self {
        self.lock_timeout_behavior = Some(behavior);
        self
    }

    pub fn soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(Some(timeout));
        self
    }

    pub fn hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(Some(timeout));
        self
    }

    pub fn suppress_remote_cache_errors(mut self, suppress: bool) -> Self {
        self.suppress_remote_cache_errors = Some(suppress);
        self
    }

    /// Layers `other` on top of `self`; fields set in `other` win.
    pub fn overlay(mut self, other: &EntryOptions) -> Self {
        self.ttl = other.ttl.or(self.ttl);
        self.grace_period = other.grace_period.or(self.grace_period);
        self.early_expiration = other.early_expiration.or(self.early_expiration);
        self.lock_timeout = other.lock_timeout.or(self.lock_timeout);
        self.lock_timeout_behavior = other.lock_timeout_behavior.or(self.lock_timeout_behavior);
        self.soft_timeout = other.soft_timeout.or(self.soft_timeout);
        self.hard_timeout = other.hard_timeout.or(self.hard_timeout);
        self.suppress_remote_cache_errors = other
            .suppress_remote_cache_errors
            .or(self.suppress_remote_cache_errors);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryState;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let options = CacheEntryOptions::default();
        assert!(options.validate().is_ok());
        assert!(options.suppress_remote_cache_errors);
        assert!(!options.grace_period.enabled);
        assert_eq!(options.fallback_duration(), Duration::ZERO);
    }

    #[test]
    fn test_merge_later_overrides_win() {
        let defaults = CacheEntryOptions::default()
            .with_ttl(Duration::from_secs(60))
            .with_early_expiration(0.5);

        let merged = defaults
            .merge(
                &EntryOptions::new()
                    .ttl(Duration::from_secs(5))
                    .no_early_expiration()
                    .soft_timeout(Duration::from_millis(10)),
            )
            .unwrap();

        assert_eq!(merged.ttl, Duration::from_secs(5));
        assert_eq!(merged.early_expiration, None);
        assert_eq!(merged.timeouts.soft, Some(Duration::from_millis(10)));
        // untouched fields keep the defaults
        assert_eq!(merged.lock_timeout, None);
    }

    #[test]
    fn test_overlay_layers() {
        let stack = EntryOptions::new()
            .ttl(Duration::from_secs(1))
            .lock_timeout(Duration::from_secs(2));
        let call = EntryOptions::new().ttl(Duration::from_secs(3));
        let layered = stack.overlay(&call);
        assert_eq!(layered.ttl, Some(Duration::from_secs(3)));
        assert_eq!(layered.lock_timeout, Some(Some(Duration::from_secs(2))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let defaults = CacheEntryOptions::default();
        assert!(defaults.merge(&EntryOptions::new().early_expiration(1.0)).is_err());
        assert!(defaults.merge(&EntryOptions::new().early_expiration(0.0)).is_err());
        assert!(defaults.merge(&EntryOptions::new().ttl(Duration::ZERO)).is_err());
        assert!(
            defaults
                .merge(
                    &EntryOptions::new()
                        .soft_timeout(Duration::from_millis(100))
                        .hard_timeout(Duration::from_millis(10))
                )
                .is_err()
        );
    }

    #[test]
    fn test_build_entry_timestamps() {
        let options = CacheEntryOptions::default()
            .with_ttl(Duration::from_millis(100))
            .with_early_expiration(0.5)
            .with_grace_period(GracePeriod::enabled(Duration::from_millis(1000)));

        let entry = options.build_entry(json!("v"), 1_000).unwrap();
        assert_eq!(entry.logical_expire_at(), 1_100);
        assert_eq!(entry.early_expire_at(), Some(1_050));
        assert_eq!(entry.grace_expire_at(), Some(2_100));
        assert_eq!(entry.state(1_049), EntryState::Fresh);
        assert_eq!(entry.state(1_050), EntryState::EarlyStale);
        assert_eq!(entry.state(1_100), EntryState::GraceStale);
    }

    #[test]
    fn test_lock_timeout_behavior_serde() {
        let behavior: LockTimeoutBehavior = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(behavior, LockTimeoutBehavior::Retry);
    }
}
