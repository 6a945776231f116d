/// Timestamps and calendar arithmetic.
///
/// Records carry their time as Unix seconds (i64, UTC); the store and the query layer work with
/// chrono `DateTime<Utc>` when they need calendar operations.  All computations are UTC.
use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

pub type Timestamp = DateTime<Utc>;

pub fn epoch() -> Timestamp {
    timestamp_from_ymd(1970, 1, 1)
}

pub fn now() -> Timestamp {
    Utc::now()
}

/// A time that is beyond anything we'll see in a sample record.
pub fn far_future() -> Timestamp {
    timestamp_from_ymd(2200, 1, 1)
}

pub fn timestamp_from_ymd(y: i32, m: u32, d: u32) -> Timestamp {
    timestamp_from_ymdhms(y, m, d, 0, 0, 0)
}

pub fn timestamp_from_ymdhms(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
    Utc.with_ymd_and_hms(y, m, d, h, mi, s)
        .single()
        .unwrap_or_else(|| panic!("Invalid date {y}-{m}-{d} {h}:{mi}:{s}"))
}

/// Parse an RFC3339 timestamp with or without subseconds, any time zone; the result is UTC.
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(e) => bail!("Bad timestamp {s}: {e}"),
    }
}

pub fn to_unix(t: Timestamp) -> i64 {
    t.timestamp()
}

pub fn from_unix(t: i64) -> Timestamp {
    Utc.timestamp_opt(t, 0).single().unwrap_or_else(epoch)
}

/// Midnight at the start of the day containing t.
pub fn this_day(t: Timestamp) -> Timestamp {
    timestamp_from_ymd(t.year(), t.month(), t.day())
}

/// Midnight at the start of the day following t, unless t is already at midnight.  Idempotent.
pub fn roundup_day(t: Timestamp) -> Timestamp {
    this_day(t + Duration::seconds(24 * 60 * 60 - 1))
}

pub fn next_day(t: Timestamp) -> Timestamp {
    this_day(t) + Duration::days(1)
}

/// The store's directory name for the day: "YYYY/MM/DD".
pub fn day_path(y: i32, m: u32, d: u32) -> String {
    format!("{y:04}/{m:02}/{d:02}")
}

pub fn truncate_to_half_hour(t: i64) -> i64 {
    let u = from_unix(t);
    let m = if u.minute() >= 30 { 30 } else { 0 };
    to_unix(timestamp_from_ymdhms(u.year(), u.month(), u.day(), u.hour(), m, 0))
}

pub fn truncate_to_hour(t: i64) -> i64 {
    let u = from_unix(t);
    to_unix(timestamp_from_ymdhms(u.year(), u.month(), u.day(), u.hour(), 0, 0))
}

pub fn truncate_to_half_day(t: i64) -> i64 {
    let u = from_unix(t);
    let h = if u.hour() >= 12 { 12 } else { 0 };
    to_unix(timestamp_from_ymdhms(u.year(), u.month(), u.day(), h, 0, 0))
}

pub fn truncate_to_day(t: i64) -> i64 {
    to_unix(this_day(from_unix(t)))
}

// Weeks start on Monday.
pub fn truncate_to_week(t: i64) -> i64 {
    let d = this_day(from_unix(t));
    let back = d.weekday().num_days_from_monday() as i64;
    to_unix(d - Duration::days(back))
}

pub fn add_half_hour(t: i64) -> i64 {
    t + 30 * 60
}

pub fn add_hour(t: i64) -> i64 {
    t + 60 * 60
}

pub fn add_half_day(t: i64) -> i64 {
    t + 12 * 60 * 60
}

pub fn add_day(t: i64) -> i64 {
    t + 24 * 60 * 60
}

pub fn add_week(t: i64) -> i64 {
    t + 7 * 24 * 60 * 60
}

pub fn format_ymdhm(t: i64) -> String {
    from_unix(t).format("%Y-%m-%d %H:%M").to_string()
}

#[test]
fn test_day_rounding() {
    let t = timestamp_from_ymdhms(2024, 2, 28, 13, 1, 0);
    assert_eq!(this_day(t), timestamp_from_ymd(2024, 2, 28));
    assert_eq!(roundup_day(t), timestamp_from_ymd(2024, 2, 29));
    assert_eq!(roundup_day(roundup_day(t)), timestamp_from_ymd(2024, 2, 29));
    assert_eq!(next_day(t), timestamp_from_ymd(2024, 2, 29));
    assert_eq!(day_path(2024, 2, 8), "2024/02/08");
}

#[test]
fn test_truncation() {
    // Wednesday
    let t = to_unix(timestamp_from_ymdhms(2024, 1, 17, 14, 47, 13));
    assert_eq!(truncate_to_half_hour(t), to_unix(timestamp_from_ymdhms(2024, 1, 17, 14, 30, 0)));
    assert_eq!(truncate_to_hour(t), to_unix(timestamp_from_ymdhms(2024, 1, 17, 14, 0, 0)));
    assert_eq!(truncate_to_half_day(t), to_unix(timestamp_from_ymdhms(2024, 1, 17, 12, 0, 0)));
    assert_eq!(truncate_to_day(t), to_unix(timestamp_from_ymd(2024, 1, 17)));
    assert_eq!(truncate_to_week(t), to_unix(timestamp_from_ymd(2024, 1, 15)));
    assert_eq!(parse_timestamp("2024-01-17T14:47:13+01:00").unwrap().hour(), 13);
}
