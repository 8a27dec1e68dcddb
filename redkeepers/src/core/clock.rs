//! UTC timestamp helpers. Core code never reads the clock itself.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Render `now` as second-precision ISO-8601 with a `Z` suffix.
pub fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parse a stored timestamp. Accepts RFC 3339 and naive `YYYY-MM-DDTHH:MM:SS[.f]` (assumed UTC).
pub fn parse_stamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Seconds elapsed since `raw`, or `None` when it cannot be parsed.
pub fn age_seconds(raw: &str, now: DateTime<Utc>) -> Option<i64> {
    parse_stamp(raw).map(|then| (now - then).num_seconds())
}
