//! Clock helpers.

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds.
///
/// All wire timestamps (event envelopes, heartbeats, queue entries) use
/// epoch millis; monotonic windows use `std::time::Instant` instead.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
