use chrono::{Datelike, Utc};
use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current day stamp. Cache expiry is day-granular, so records
/// carry this rather than a full timestamp.
#[inline]
pub fn day_stamp() -> u32 {
    Utc::now().num_days_from_ce() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_nonzero() {
        assert!(timestamp_secs() > 1_500_000_000);
    }

    #[test]
    fn test_day_stamp_plausible() {
        // 2020-01-01 onward.
        assert!(day_stamp() > 737_400);
    }
}
