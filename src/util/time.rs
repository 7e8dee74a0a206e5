//! Timing utilities
//!
//! Wall-clock timestamps are used for telemetry frames and log records;
//! monotonic time (via `std::time::Instant`) is used for poll budgets and
//! access-statistics timing and never leaves the process.

use chrono::{Local, TimeZone};

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Render a nanosecond timestamp as the record time string,
/// e.g. `2021-03-05-14:02:07.123456789`.
pub fn format_timestamp(nanos: u64) -> String {
    let secs = (nanos / 1_000_000_000) as i64;
    let sub = (nanos % 1_000_000_000) as u32;
    match Local.timestamp_opt(secs, sub) {
        chrono::LocalResult::Single(dt) => {
            dt.format("%Y-%m-%d-%H:%M:%S%.9f").to_string()
        }
        _ => format!("{}.{:09}", secs, sub),
    }
}

/// Render the current time in a form safe for file names,
/// e.g. `2021-03-05-14-02-07`.
pub fn file_timestamp() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}
