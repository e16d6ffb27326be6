//! Wall clock used for job and liveness timestamps.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Current UTC instant, truncated to microseconds.
///
/// Both backings store microsecond precision, so truncating here keeps
/// timestamps identical whichever store produced them.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(now)
}

/// Whether `instant` lies further in the past than `older_than`.
pub fn is_older_than(instant: DateTime<Utc>, older_than: std::time::Duration) -> bool {
    match TimeDelta::from_std(older_than) {
        Ok(limit) => now().signed_duration_since(instant) > limit,
        // An age beyond chrono's range can never be exceeded.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_has_microsecond_precision() {
        let t = now();
        assert_eq!(t.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_age_comparison() {
        let past = now() - TimeDelta::seconds(10);
        assert!(is_older_than(past, Duration::from_secs(5)));
        assert!(!is_older_than(past, Duration::from_secs(60)));
        assert!(!is_older_than(now(), Duration::MAX));
    }
}
