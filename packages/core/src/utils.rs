// ABOUTME: Shared utility functions for Warden
// ABOUTME: Epoch conversions for persisted timestamps and scheduling jitter

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

/// Convert a timestamp to milliseconds since the Unix epoch
pub fn to_epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert milliseconds since the Unix epoch back to a timestamp
///
/// Out-of-range values clamp to the epoch rather than failing.
pub fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Current time truncated to the millisecond precision timestamps are stored at
pub fn now_millis() -> DateTime<Utc> {
    from_epoch_millis(Utc::now().timestamp_millis())
}

/// Random offset in `[-max, max]` milliseconds, 0 when `max` is 0
pub fn jitter_millis(max: u64) -> i64 {
    if max == 0 {
        return 0;
    }
    let bound = i64::try_from(max).unwrap_or(i64::MAX);
    rand::thread_rng().gen_range(-bound..=bound)
}
