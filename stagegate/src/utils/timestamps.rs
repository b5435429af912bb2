//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// UTC timestamp used for artifacts, history entries and instance records.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 string with microsecond
/// precision, e.g. `2026-01-31T12:00:00.123456+00:00`.
///
/// # Examples
///
/// ```
/// use stagegate::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Formats a timestamp the same way as [`iso_timestamp`].
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Milliseconds elapsed between two timestamps, clamped at zero.
#[must_use]
pub fn elapsed_ms(from: &Timestamp, to: &Timestamp) -> u64 {
    u64::try_from((*to - *from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2026-01-31T12:00:00.000000+00:00");
    }

    #[test]
    fn test_elapsed_ms_clamps_negative() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 2).unwrap();
        assert_eq!(elapsed_ms(&earlier, &later), 2000);
        assert_eq!(elapsed_ms(&later, &earlier), 0);
    }
}
