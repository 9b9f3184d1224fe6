use chrono::{DateTime, TimeDelta, Utc};
use std::num::NonZeroU64;
use std::time::Duration;

pub const MINUTE_MS: u64 = 60_000;
pub const DAY_MS: u64 = 86_400_000;

/// A fixed counting window, aligned to the Unix epoch in UTC.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Period {
    /// UTC calendar day, keyed `YYYY-MM-DD`
    Day,
    /// UTC wall-clock minute, keyed `YYYY-MM-DDTHH:MM`
    Minute,
    /// Any other window length
    Fixed(NonZeroU64),
}

/// The concrete window `now` falls into.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Window {
    pub period: Period,
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// A catalog entry without `period_ms` counts per calendar day.
    pub fn from_period_ms(period_ms: Option<u64>) -> Period {
        match period_ms {
            None | Some(DAY_MS) => Period::Day,
            Some(MINUTE_MS) => Period::Minute,
            Some(ms) => NonZeroU64::new(ms).map_or(Period::Day, Period::Fixed),
        }
    }

    pub fn length_ms(self) -> u64 {
        match self {
            Period::Day => DAY_MS,
            Period::Minute => MINUTE_MS,
            Period::Fixed(ms) => ms.get(),
        }
    }

    pub fn window(self, now: DateTime<Utc>) -> Window {
        let length = i64::try_from(self.length_ms()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();
        let start_ms = now_ms - now_ms.rem_euclid(length);
        let start = DateTime::from_timestamp_millis(start_ms).unwrap_or(now);
        let end = start
            .checked_add_signed(TimeDelta::milliseconds(length))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let key = match self {
            Period::Day => start.format("%Y-%m-%d").to_string(),
            Period::Minute => start.format("%Y-%m-%dT%H:%M").to_string(),
            Period::Fixed(ms) => format!("{}+{ms}ms", start.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
        };
        Window {
            period: self,
            key,
            start,
            end,
        }
    }
}

impl Window {
    /// Time left until the next window opens. Zero if `now` is already past `end`.
    pub fn reset_in(&self, now: DateTime<Utc>) -> Duration {
        (self.end - now).to_std().unwrap_or_default()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_period_from_period_ms() {
        assert_eq!(Period::from_period_ms(None), Period::Day);
        assert_eq!(Period::from_period_ms(Some(DAY_MS)), Period::Day);
        assert_eq!(Period::from_period_ms(Some(MINUTE_MS)), Period::Minute);
        assert_eq!(
            Period::from_period_ms(Some(3_600_000)),
            Period::Fixed(NonZeroU64::new(3_600_000).unwrap())
        );
    }

    #[test]
    fn test_day_window_is_utc_calendar_day() {
        let now = at(2026, 3, 14, 18, 57, 3);
        let window = Period::Day.window(now);
        assert_eq!(window.key, "2026-03-14");
        assert_eq!(window.start, at(2026, 3, 14, 0, 0, 0));
        assert_eq!(window.end, at(2026, 3, 15, 0, 0, 0));
        assert_eq!(
            window.reset_in(now),
            Duration::from_secs(5 * 3600 + 2 * 60 + 57)
        );
        assert!(window.contains(now));
        assert!(!window.contains(window.end));
    }

    #[test]
    fn test_minute_window() {
        let now = at(2026, 3, 14, 23, 59, 31);
        let window = Period::Minute.window(now);
        assert_eq!(window.key, "2026-03-14T23:59");
        assert_eq!(window.end, at(2026, 3, 15, 0, 0, 0));
        assert_eq!(window.reset_in(now), Duration::from_secs(29));
    }

    #[test]
    fn test_fixed_window_is_epoch_aligned() {
        let hour = Period::from_period_ms(Some(3_600_000));
        let window = hour.window(at(2026, 3, 14, 18, 57, 3));
        assert_eq!(window.start, at(2026, 3, 14, 18, 0, 0));
        assert_eq!(window.end, at(2026, 3, 14, 19, 0, 0));
        assert_eq!(window.key, "2026-03-14T18:00:00.000Z+3600000ms");
    }

    #[test]
    fn test_consecutive_days_have_distinct_keys() {
        let before = Period::Day.window(at(2026, 3, 14, 23, 59, 59));
        let after = Period::Day.window(at(2026, 3, 15, 0, 0, 0));
        assert_ne!(before.key, after.key);
        assert_eq!(before.end, after.start);
    }

    #[test]
    fn test_reset_in_saturates_at_zero() {
        let window = Period::Minute.window(at(2026, 3, 14, 10, 0, 0));
        assert_eq!(window.reset_in(at(2026, 3, 14, 10, 5, 0)), Duration::ZERO);
    }
}
