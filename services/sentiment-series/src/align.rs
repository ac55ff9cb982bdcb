//! Bucket alignment
//!
//! Maps instants onto bucket windows. Boundaries are multiples of the
//! resolution measured from the Unix epoch; since every resolution divides
//! 24 hours, that is the same as measuring from any midnight UTC. Keys
//! computed independently by different writers therefore always agree.
//!
//! Sort keys are fixed-width ISO-8601 strings (`YYYY-MM-DDTHH:MM:SSZ`) so
//! that lexicographic order equals chronological order. That only holds
//! for years 0000 through 9999; scan bounds outside it go through
//! [`clamped_sort_key`].

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use types::resolution::Resolution;

/// Format of bucket sort keys.
const SORT_KEY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Unix seconds of `0000-01-01T00:00:00Z`, the earliest fixed-width key.
pub const MIN_KEYED_SECS: i64 = -62_167_219_200;

/// Unix seconds of `9999-12-31T23:59:59Z`, the latest fixed-width key.
pub const MAX_KEYED_SECS: i64 = 253_402_300_799;

/// Floor a timestamp to the start of its containing bucket.
///
/// Sub-second precision is discarded. Negative (pre-1970) timestamps floor
/// toward negative infinity like every other instant. `DateTime::MIN_UTC`
/// is midnight, so every representable instant has a representable start;
/// the result saturates there regardless.
pub fn floor_to_bucket(timestamp: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let width = resolution.seconds();
    let start = timestamp.timestamp().div_euclid(width) * width;
    DateTime::from_timestamp(start, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Exclusive end of the bucket starting at `bucket_start`.
///
/// Saturates at `DateTime::MAX_UTC` for the last representable day.
pub fn bucket_end(bucket_start: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    bucket_start
        .checked_add_signed(resolution.duration())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whether `now` falls inside `[bucket_start, bucket_start + resolution)`.
pub fn contains(bucket_start: DateTime<Utc>, resolution: Resolution, now: DateTime<Utc>) -> bool {
    bucket_start <= now && now < bucket_end(bucket_start, resolution)
}

/// Percentage (0–100) of the bucket window that has elapsed at `now`.
///
/// Exactly 100 once the window has closed, exactly 0 at its start.
pub fn progress(now: DateTime<Utc>, bucket_start: DateTime<Utc>, resolution: Resolution) -> f64 {
    let elapsed = now - bucket_start;
    let width = resolution.duration();
    if elapsed >= width {
        return 100.0;
    }
    if elapsed <= Duration::zero() {
        return 0.0;
    }
    // Inside the window both fit in i64 nanoseconds (width <= 24h).
    let elapsed_ns = elapsed.num_nanoseconds().unwrap_or(i64::MAX) as f64;
    let width_ns = (resolution.seconds() * 1_000_000_000) as f64;
    elapsed_ns / width_ns * 100.0
}

/// Storage sort key for a bucket start.
pub fn sort_key(bucket_start: DateTime<Utc>) -> String {
    bucket_start.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Sort key of `instant` clamped into the fixed-width key range.
///
/// Used for range scan bounds, where an unclamped far-future or ancient
/// bound would render with a sign prefix and sort on the wrong side.
pub fn clamped_sort_key(instant: DateTime<Utc>) -> String {
    let secs = instant.timestamp().clamp(MIN_KEYED_SECS, MAX_KEYED_SECS);
    match DateTime::from_timestamp(secs, 0) {
        Some(clamped) => sort_key(clamped),
        None => sort_key(instant),
    }
}

/// Parse a sort key back into an instant.
pub fn parse_sort_key(key: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, SORT_KEY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}


// ── Property-Based Tests ────────────────────────────────────────────
