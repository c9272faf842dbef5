//! Calendar windows used to scope counters.
//!
//! Weeks start on Monday 00:00:00.000 UTC and end on the following Sunday at
//! 23:59:59.999 UTC. Week numbers count 7-day blocks from January 1st of the
//! year the week starts in, so they are not ISO-8601 week numbers.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::time::start_of_day;

/// Raised when window arithmetic leaves chrono's representable range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Instant {0} is outside the supported calendar range")]
    OutOfRange(String),
}

/// Boundaries and identifier of the week containing an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekWindow {
    pub week_start: DateTime<Utc>,
    pub week_end: DateTime<Utc>,
    pub week_year: i32,
    pub week_number: u32,
}

impl WeekWindow {
    /// Computes the window for `instant`.
    pub fn for_instant(instant: DateTime<Utc>) -> Result<Self, WindowError> {
        let out_of_range = || WindowError::OutOfRange(instant.to_rfc3339());

        let date = instant.date_naive();
        let offset = i64::from(date.weekday().num_days_from_monday());
        let start_date = date
            .checked_sub_signed(Duration::days(offset))
            .ok_or_else(out_of_range)?;

        let week_start = start_of_day(start_date);
        let week_end = week_start
            .checked_add_signed(Duration::days(7) - Duration::milliseconds(1))
            .ok_or_else(out_of_range)?;

        let week_year = start_date.year();
        let jan_first = NaiveDate::from_ymd_opt(week_year, 1, 1).ok_or_else(out_of_range)?;
        let days_in = (start_date - jan_first).num_days();
        let week_number = u32::try_from(days_in / 7 + 1).map_err(|_| out_of_range())?;

        Ok(Self {
            week_start,
            week_end,
            week_year,
            week_number,
        })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.week_start && instant <= self.week_end
    }

    /// Window of the week immediately before this one.
    pub fn previous(&self) -> Result<Self, WindowError> {
        let earlier = self
            .week_start
            .checked_sub_signed(Duration::days(1))
            .ok_or_else(|| WindowError::OutOfRange(self.week_start.to_rfc3339()))?;
        Self::for_instant(earlier)
    }

    /// Time left until the window closes, zero once it has.
    pub fn remaining_from(&self, instant: DateTime<Utc>) -> Duration {
        let left = self.week_end - instant;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn ymd_hms(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_wednesday_maps_to_surrounding_monday_and_sunday() {
        let window = WeekWindow::for_instant(ymd_hms(2024, 5, 8, 14, 30, 0)).unwrap();
        assert_eq!(window.week_start, ymd_hms(2024, 5, 6, 0, 0, 0));
        assert_eq!(
            window.week_end,
            ymd_hms(2024, 5, 12, 23, 59, 59) + Duration::milliseconds(999)
        );
        assert_eq!(window.week_end.nanosecond(), 999_000_000);
    }

    #[test]
    fn test_monday_midnight_is_its_own_start() {
        let monday = ymd_hms(2024, 5, 6, 0, 0, 0);
        let window = WeekWindow::for_instant(monday).unwrap();
        assert_eq!(window.week_start, monday);
    }

    #[test]
    fn test_sunday_late_belongs_to_previous_monday() {
        let sunday = ymd_hms(2024, 5, 12, 23, 59, 59);
        let window = WeekWindow::for_instant(sunday).unwrap();
        assert_eq!(window.week_start, ymd_hms(2024, 5, 6, 0, 0, 0));
        assert!(window.contains(sunday));
    }

    #[test]
    fn test_year_rollover_week() {
        // Monday 2024-12-30 through Sunday 2025-01-05.
        for day in [30, 31] {
            let w = WeekWindow::for_instant(ymd_hms(2024, 12, day, 9, 0, 0)).unwrap();
            assert_eq!(w.week_start, ymd_hms(2024, 12, 30, 0, 0, 0));
            assert_eq!(w.week_year, 2024);
        }
        for day in 1..=5 {
            let w = WeekWindow::for_instant(ymd_hms(2025, 1, day, 9, 0, 0)).unwrap();
            assert_eq!(w.week_start, ymd_hms(2024, 12, 30, 0, 0, 0));
            assert_eq!(w.week_end.date_naive(), NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());
            assert_eq!(w.week_year, 2024);
        }
    }

    #[test]
    fn test_week_number_counts_blocks_from_jan_first() {
        // 2024-01-01 is a Monday.
        let first = WeekWindow::for_instant(ymd_hms(2024, 1, 3, 0, 0, 0)).unwrap();
        assert_eq!(first.week_number, 1);
        let second = WeekWindow::for_instant(ymd_hms(2024, 1, 8, 0, 0, 0)).unwrap();
        assert_eq!(second.week_number, 2);
        // 2024-12-30 is day 364 of the year.
        let last = WeekWindow::for_instant(ymd_hms(2024, 12, 31, 0, 0, 0)).unwrap();
        assert_eq!(last.week_number, 53);
    }

    #[test]
    fn test_week_starting_in_previous_year_keeps_that_year() {
        // 2023-01-01 is a Sunday, so its week starts 2022-12-26.
        let w = WeekWindow::for_instant(ymd_hms(2023, 1, 1, 12, 0, 0)).unwrap();
        assert_eq!(w.week_year, 2022);
        assert_eq!(w.week_start, ymd_hms(2022, 12, 26, 0, 0, 0));
    }

    #[test]
    fn test_previous_window() {
        let w = WeekWindow::for_instant(ymd_hms(2025, 1, 2, 0, 0, 0)).unwrap();
        let prev = w.previous().unwrap();
        assert_eq!(prev.week_start, ymd_hms(2024, 12, 23, 0, 0, 0));
    }

    #[test]
    fn test_remaining_from_never_negative() {
        let w = WeekWindow::for_instant(ymd_hms(2024, 5, 8, 0, 0, 0)).unwrap();
        assert_eq!(w.remaining_from(ymd_hms(2024, 6, 1, 0, 0, 0)), Duration::zero());
        assert!(w.remaining_from(ymd_hms(2024, 5, 8, 0, 0, 0)) > Duration::days(4));
    }
}
