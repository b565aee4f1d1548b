//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds elapsed between `since` and `now`, clamped at zero
pub fn elapsed_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[tokio::test]
    async fn test_now_successive_calls_advance() {
        let time1 = now();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let time2 = now();
        assert!(time2 > time1);
    }

    #[test]
    fn test_elapsed_seconds_forward() {
        let start = now();
        let later = start + Duration::seconds(90);
        assert_eq!(elapsed_seconds(start, later), 90);
    }

    #[test]
    fn test_elapsed_seconds_clamps_negative() {
        let start = now();
        let earlier = start - Duration::seconds(5);
        assert_eq!(elapsed_seconds(start, earlier), 0);
    }
}
