use std::time::Duration;

use time::OffsetDateTime;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Entry timestamps are absolute so that every process evaluates staleness
/// against the same instants regardless of when it read the entry.
pub fn now_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Duration from `now` until `deadline`, or `None` if the deadline has passed.
pub fn millis_until(now: u64, deadline: u64) -> Option<Duration> {
    deadline
        .checked_sub(now)
        .filter(|remaining| *remaining > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_millis_until() {
        assert_eq!(millis_until(100, 150), Some(Duration::from_millis(50)));
        assert_eq!(millis_until(150, 150), None);
        assert_eq!(millis_until(200, 150), None);
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(42)), 42);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }
}
