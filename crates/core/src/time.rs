// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ISO-8601 timestamp helpers shared by state records and logs.

use chrono::{Local, NaiveDateTime, TimeZone};
use std::time::Duration;

/// Current local time as `YYYY-MM-DDTHH:MM:SS`.
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Parse an ISO timestamp produced by [`now_iso`] into epoch seconds.
/// Returns `None` for empty or malformed input.
pub fn parse_iso(iso: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

/// Compact elapsed-time label for init logs: `137ms` below a second,
/// `2.4s` above.
pub fn elapsed_label(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

#[cfg(test)]
#[path = "time_tests.rs"]
mod tests;
