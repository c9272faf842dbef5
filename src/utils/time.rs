use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Mutex;

/// Source of the current instant. Every window computation reads time
/// through this trait so tests can pin or advance the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = *guard + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Midnight UTC at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// First instant of the calendar month containing `instant`.
pub fn start_of_month(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(instant.year(), instant.month(), 1).map(start_of_day)
}

/// `instant` shifted forward by one calendar month, day clamped to the
/// target month's length.
pub fn add_one_month(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    instant.checked_add_months(Months::new(1))
}

/// Index of the fixed-size window containing `instant`.
pub fn bucket_index(instant: DateTime<Utc>, window: Duration) -> i64 {
    let secs = window.num_seconds().max(1);
    instant.timestamp().div_euclid(secs)
}

/// Formats a duration into a human-readable string
/// (e.g., "2h 3m 10s" or "10m 5s")
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.num_seconds();
    if total_seconds <= 0 {
        return "0s".to_string();
    }

    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut result = String::new();
    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }
    if minutes > 0 || hours > 0 {
        result.push_str(&format!("{}m ", minutes));
    }
    result.push_str(&format!("{}s", seconds));

    result
}
