//! Time and timestamp utilities

use std::time::Duration;

use chrono::Utc;

/// Current time as nanoseconds since the Unix epoch
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Duration as signed nanoseconds, saturating at `i64::MAX`
pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Next store timestamp for a log whose newest message has `previous`.
///
/// Timestamps within a channel are strictly increasing so that a timestamp
/// maps back to exactly one sequence.
pub fn next_timestamp(previous: i64) -> i64 {
    now_nanos().max(previous.saturating_add(1))
}

/// Serde helper storing a `Duration` as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_nanos_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_nanos() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn test_next_timestamp_strictly_increases() {
        let future = now_nanos() + 60_000_000_000;
        assert_eq!(next_timestamp(future), future + 1);
        let t1 = next_timestamp(0);
        let t2 = next_timestamp(t1);
        assert!(t2 > t1);
    }

    #[test]
    fn test_duration_nanos_saturates() {
        assert_eq!(duration_nanos(Duration::from_secs(1)), 1_000_000_000);
        assert_eq!(duration_nanos(Duration::MAX), i64::MAX);
    }
}
