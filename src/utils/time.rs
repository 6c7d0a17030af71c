// src/utils/time.rs - Time helpers shared by the envelope and lifecycle code

use chrono::{DateTime, Utc};

/// Wall-clock helpers; the wire carries epoch milliseconds.
pub struct Time;

impl Time {
    /// Get current UTC time
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Get current timestamp as milliseconds since epoch
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Create a DateTime from milliseconds since epoch
    pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let now = Time::now_millis();
        let dt = Time::from_millis(now).unwrap();
        assert_eq!(dt.timestamp_millis(), now);
    }
}
