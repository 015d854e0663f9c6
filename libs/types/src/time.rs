//! Minute arithmetic and window constants
//!
//! Aggregates are kept per calendar minute, counted from the Unix epoch in
//! UTC. A token's retained window is the trailing `WINDOW_MINUTES` minutes.

use chrono::{DateTime, Utc};

/// Width of the retained window: 24 hours of one-minute buckets.
pub const WINDOW_MINUTES: i64 = 24 * 60;

/// Width of the "last 5 minutes" view.
pub const WINDOW_5M: i64 = 5;

/// Width of the "last hour" view.
pub const WINDOW_1H: i64 = 60;

/// Width of the "last 24 hours" view.
pub const WINDOW_24H: i64 = WINDOW_MINUTES;

/// Minute index of `t` since the Unix epoch (floor division, so instants
/// before 1970 land in negative minutes rather than rounding toward zero).
pub fn minute_of(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

/// First minute of a window of `WINDOW_MINUTES` that ends at `last_minute`.
pub fn window_start(last_minute: i64) -> i64 {
    last_minute - WINDOW_MINUTES + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_minute_of_truncates() {
        let t = Utc.with_ymd_and_hms(1970, 1, 1, 0, 1, 59).unwrap();
        assert_eq!(minute_of(t), 1);
    }

    #[test]
    fn test_minute_of_before_epoch_floors() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 30).unwrap();
        assert_eq!(minute_of(t), -1);
    }

    #[test]
    fn test_window_start_covers_window() {
        let last = 10_000;
        let start = window_start(last);
        assert_eq!(last - start + 1, WINDOW_MINUTES);
    }
}
