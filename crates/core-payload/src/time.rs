//! Detector time ("utime"): u64 tenths of nanoseconds since Jan 1, 00:00:00
//! UTC of the run year. Calendar conversions go through `chrono` and truncate
//! to whole nanoseconds; the sub-nanosecond digit only matters for scaler
//! arithmetic, which stays in utime throughout.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::PayloadError;

pub const TENTH_NS_PER_SEC: u64 = 10_000_000_000;
pub const TENTH_NS_PER_MS: u64 = 10_000_000;

/// One scaler clock tick: 250 * 2^16 tenth-ns = 1.6384 ms.
pub const SCALER_UDT: u64 = 250 * (1 << 16);

/// One staging column: 2 ms.
pub const STAGING_UDT: u64 = 2 * TENTH_NS_PER_MS;

/// One base analysis bin: 500 ms.
pub const BASE_UDT: u64 = 500 * TENTH_NS_PER_MS;

pub fn year_start(year: i32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .expect("Jan 1 exists for every year")
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
}

/// Convert a utime into a calendar timestamp in the given run year.
pub fn utime_to_datetime(year: i32, utime: u64) -> NaiveDateTime {
    let secs = (utime / TENTH_NS_PER_SEC) as i64;
    let nanos = ((utime % TENTH_NS_PER_SEC) / 10) as u32;
    year_start(year) + chrono::Duration::seconds(secs) + chrono::Duration::nanoseconds(nanos as i64)
}

/// Convert a calendar timestamp into a utime relative to its own year.
/// Fails for timestamps before the year start (never the case for valid
/// inputs, but the parser surfaces it rather than wrapping).
pub fn datetime_to_utime(dt: NaiveDateTime) -> Result<u64, PayloadError> {
    let start = year_start(dt.year());
    let delta = dt - start;
    let ns = delta
        .num_nanoseconds()
        .filter(|&n| n >= 0)
        .ok_or(PayloadError::TimeOutOfRange)?;
    Ok(ns as u64 * 10)
}

/// Parse a CLI time argument, `YYYY-MM-DDThh:mm:ss[.fffff]`.
pub fn parse_request_time(s: &str) -> Result<NaiveDateTime, PayloadError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| PayloadError::BadTimestamp(s.to_string()))
}

/// Parse a muon-stream line timestamp, `YYYY-MM-DD hh:mm:ss.fffffffff`.
pub fn parse_muon_time(s: &str) -> Result<NaiveDateTime, PayloadError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|_| PayloadError::BadTimestamp(s.to_string()))
}
