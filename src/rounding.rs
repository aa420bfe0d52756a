//! Bucket rounding
//!
//! Maps source timestamps to bucket-start timestamps under the configured
//! interval and time zone. Fixed intervals align to the epoch modulo the
//! interval, translated by the zone's UTC offset at the rounded instant;
//! calendar intervals align to civil calendar boundaries in the zone,
//! respecting DST transitions.
//!
//! `round_down` is pure and monotonic in its argument; preparing a
//! [`Rounding`] once per shard run keeps the per-document path free of
//! allocation.

use crate::config::{CalendarUnit, DownsampleConfig, DownsampleInterval};
use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

/// Prepared rounding for one shard run
#[derive(Debug, Clone)]
pub struct Rounding {
    interval: DownsampleInterval,
    tz: Tz,
}

impl Rounding {
    /// Prepare rounding from a downsample config
    pub fn new(config: &DownsampleConfig) -> Self {
        Self {
            interval: config.interval,
            tz: config.time_zone,
        }
    }

    /// Largest bucket-start timestamp that is `<= ts_ms`
    pub fn round_down(&self, ts_ms: i64) -> i64 {
        // Timestamps outside chrono's representable range cannot occur in
        // a real shard; fall through unchanged rather than panic.
        self.try_round(ts_ms).unwrap_or(ts_ms)
    }

    fn try_round(&self, ts_ms: i64) -> Option<i64> {
        match self.interval {
            DownsampleInterval::Fixed { millis } => {
                let offset = self.utc_offset_ms(ts_ms)?;
                let local = ts_ms.checked_add(offset)?;
                let bucket_local = local.div_euclid(millis) * millis;
                bucket_local.checked_sub(offset)
            }
            DownsampleInterval::Calendar { unit } => {
                let utc = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
                let local = utc.with_timezone(&self.tz).naive_local();
                let truncated = truncate_civil(local, unit)?;
                self.resolve_local(truncated)
            }
        }
    }

    /// The zone's UTC offset at the given instant, in milliseconds
    fn utc_offset_ms(&self, ts_ms: i64) -> Option<i64> {
        let utc = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
        let offset = self.tz.offset_from_utc_datetime(&utc.naive_utc());
        Some(i64::from(offset.fix().local_minus_utc()) * 1000)
    }

    /// Map a truncated civil time back to an instant
    ///
    /// Ambiguous civil times (clock set back) resolve to the earlier
    /// instant; civil times inside a DST gap (clock set forward) resolve to
    /// the first representable instant after the gap.
    fn resolve_local(&self, naive: NaiveDateTime) -> Option<i64> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.timestamp_millis()),
            LocalResult::Ambiguous(a, b) => Some(a.timestamp_millis().min(b.timestamp_millis())),
            LocalResult::None => {
                let mut probe = naive;
                for _ in 0..16 {
                    probe += Duration::minutes(15);
                    match self.tz.from_local_datetime(&probe) {
                        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                            return Some(dt.timestamp_millis());
                        }
                        LocalResult::None => {}
                    }
                }
                None
            }
        }
    }
}

/// Truncate a civil datetime down to the given calendar boundary
fn truncate_civil(local: NaiveDateTime, unit: CalendarUnit) -> Option<NaiveDateTime> {
    let date = local.date();
    match unit {
        CalendarUnit::Minute => date.and_hms_opt(local.hour(), local.minute(), 0),
        CalendarUnit::Hour => date.and_hms_opt(local.hour(), 0, 0),
        CalendarUnit::Day => date.and_hms_opt(0, 0, 0),
        CalendarUnit::Week => {
            let days_from_monday = u64::from(date.weekday().num_days_from_monday());
            date.checked_sub_days(Days::new(days_from_monday))?
                .and_hms_opt(0, 0, 0)
        }
        CalendarUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?
            .and_hms_opt(0, 0, 0),
        CalendarUnit::Quarter => {
            let quarter_start = (date.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), quarter_start, 1)?.and_hms_opt(0, 0, 0)
        }
        CalendarUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0),
    }
}

/// Format a bucket timestamp the way the source index formats dates
///
/// Millisecond-precision ISO-8601 in UTC, e.g. `2024-03-01T10:00:00.000Z`.
pub fn format_timestamp(ts_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => ts_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America::New_York, Europe::Berlin, UTC};

    fn rounding(interval: DownsampleInterval, tz: Tz) -> Rounding {
        let config = DownsampleConfig::new(interval).with_time_zone(tz);
        Rounding::new(&config)
    }

    fn ms(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    #[test]
    fn test_fixed_hour_utc() {
        let r = rounding(DownsampleInterval::hours(1), UTC);
        assert_eq!(
            r.round_down(ms("2024-03-01T10:42:17.500Z")),
            ms("2024-03-01T10:00:00Z")
        );
        assert_eq!(
            r.round_down(ms("2024-03-01T10:00:00Z")),
            ms("2024-03-01T10:00:00Z")
        );
    }

    #[test]
    fn test_fixed_fifteen_minutes() {
        let r = rounding(DownsampleInterval::minutes(15), UTC);
        assert_eq!(
            r.round_down(ms("2024-03-01T10:44:59Z")),
            ms("2024-03-01T10:30:00Z")
        );
    }

    #[test]
    fn test_fixed_negative_timestamps_round_down() {
        let r = rounding(DownsampleInterval::hours(1), UTC);
        // 1969-12-31T23:30:00Z rounds to 23:00, not up to the epoch.
        assert_eq!(r.round_down(-30 * 60_000), -3_600_000);
    }

    #[test]
    fn test_fixed_interval_translated_by_zone_offset() {
        // New York is UTC-5 in winter: day-sized fixed buckets align to
        // local midnight, which is 05:00 UTC.
        let r = rounding(
            DownsampleInterval::Fixed {
                millis: 24 * 3_600_000,
            },
            New_York,
        );
        assert_eq!(
            r.round_down(ms("2024-01-10T14:00:00Z")),
            ms("2024-01-10T05:00:00Z")
        );
    }

    #[test]
    fn test_calendar_month() {
        let r = rounding(
            DownsampleInterval::calendar(CalendarUnit::Month),
            UTC,
        );
        assert_eq!(
            r.round_down(ms("2024-02-29T23:59:59.999Z")),
            ms("2024-02-01T00:00:00Z")
        );
    }

    #[test]
    fn test_calendar_week_starts_monday() {
        let r = rounding(DownsampleInterval::calendar(CalendarUnit::Week), UTC);
        // 2024-03-07 is a Thursday; the week began Monday 2024-03-04.
        assert_eq!(
            r.round_down(ms("2024-03-07T12:00:00Z")),
            ms("2024-03-04T00:00:00Z")
        );
    }

    #[test]
    fn test_calendar_quarter_and_year() {
        let r = rounding(DownsampleInterval::calendar(CalendarUnit::Quarter), UTC);
        assert_eq!(
            r.round_down(ms("2024-08-15T00:00:00Z")),
            ms("2024-07-01T00:00:00Z")
        );

        let r = rounding(DownsampleInterval::calendar(CalendarUnit::Year), UTC);
        assert_eq!(
            r.round_down(ms("2024-08-15T00:00:00Z")),
            ms("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_calendar_day_across_dst() {
        // Berlin springs forward 2024-03-31 02:00 -> 03:00. The civil day
        // boundary still resolves to local midnight, UTC+1.
        let r = rounding(DownsampleInterval::calendar(CalendarUnit::Day), Berlin);
        assert_eq!(
            r.round_down(ms("2024-03-31T12:00:00Z")),
            ms("2024-03-30T23:00:00Z")
        );
    }

    #[test]
    fn test_calendar_hour_in_ambiguous_window_is_stable() {
        // Berlin falls back 2024-10-27 03:00 -> 02:00; the repeated civil
        // hour resolves to the earlier instant, and rounding stays
        // idempotent.
        let r = rounding(DownsampleInterval::calendar(CalendarUnit::Hour), Berlin);
        let t = ms("2024-10-27T01:30:00Z");
        let bucket = r.round_down(t);
        assert!(bucket <= t);
        assert_eq!(r.round_down(bucket), bucket);
    }

    #[test]
    fn test_round_down_is_monotonic() {
        let r = rounding(DownsampleInterval::minutes(30), New_York);
        let start = ms("2024-03-10T05:00:00Z"); // spring-forward day
        let mut prev = r.round_down(start);
        for step in 1..240 {
            let t = start + step * 60_000;
            let bucket = r.round_down(t);
            assert!(bucket >= prev, "bucket went backwards at step {step}");
            assert!(bucket <= t);
            prev = bucket;
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(ms("2024-03-01T10:00:00Z")),
            "2024-03-01T10:00:00.000Z"
        );
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000Z");
    }
}
