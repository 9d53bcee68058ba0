//! Wall-clock helpers. All timestamps on the wire are epoch milliseconds;
//! monotonic decisions (backoff, heartbeat deadlines) use `tokio::time::Instant`
//! so tests can drive time with the paused clock.

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as an RFC3339 string, for logs and health output.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_recent() {
        // Anything after 2020 and before 2100.
        let ms = now_ms();
        assert!(ms > 1_577_836_800_000);
        assert!(ms < 4_102_444_800_000);
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn rfc3339_parses_back() {
        let s = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&s).is_ok());
    }
}
