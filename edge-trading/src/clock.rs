//! Market clock: New York wall time, trading weeks and session phases.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

use edge_common::config::ScheduleConfig;

pub use chrono_tz::America::New_York;

/// A timestamp in exchange time.
pub type MarketTime = DateTime<Tz>;

/// Source of "now". Injected so schedules can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> MarketTime;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> MarketTime {
        Utc::now().with_timezone(&New_York)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<MarketTime>,
}

impl FixedClock {
    pub fn new(now: MarketTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: MarketTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> MarketTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Monday of the trading week `date` belongs to. Weekends roll forward.
pub fn trading_week_monday(date: NaiveDate) -> NaiveDate {
    let date = match date.weekday() {
        Weekday::Sat => date + Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    };
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

// ============================================================================
// WeekId
// ============================================================================

/// Calendar-week identifier (`YYYY-Www`, Monday-first week numbers).
///
/// Derived from the Monday of the trading week, so a Saturday pipeline run
/// and the following Monday's execution share one id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekId(String);

impl WeekId {
    pub fn for_date(date: NaiveDate) -> Self {
        Self(trading_week_monday(date).format("%Y-W%W").to_string())
    }

    pub fn current(clock: &dyn Clock) -> Self {
        Self::for_date(clock.now().date_naive())
    }

    /// Accept a stored or user-supplied id.
    pub fn parse(value: &str) -> Option<Self> {
        let (year, week) = value.split_once("-W")?;
        let valid = year.len() == 4
            && week.len() == 2
            && year.chars().all(|c| c.is_ascii_digit())
            && week.parse::<u32>().is_ok_and(|w| w <= 53);
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WeekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Market Hours
// ============================================================================

/// Where in the trading calendar a moment falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    MarketOpen,
    OffHours,
    Weekend,
}

/// Regular session boundaries in New York time.
#[derive(Debug, Clone, Copy)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self::from_config(&ScheduleConfig::default())
    }
}

impl MarketHours {
    pub fn from_config(schedule: &ScheduleConfig) -> Self {
        Self {
            open: schedule.market_open_time(),
            close: schedule.market_close_time(),
        }
    }

    pub fn is_trading_day(now: &MarketTime) -> bool {
        is_weekday(now.date_naive())
    }

    pub fn phase(&self, now: &MarketTime) -> SessionPhase {
        if !Self::is_trading_day(now) {
            return SessionPhase::Weekend;
        }
        let t = now.time();
        if t >= self.open && t < self.close {
            SessionPhase::MarketOpen
        } else {
            SessionPhase::OffHours
        }
    }

    pub fn is_open(&self, now: &MarketTime) -> bool {
        self.phase(now) == SessionPhase::MarketOpen
    }
}

/// Minutes from `at` to `now` on the same day (negative before `at`).
pub fn minutes_since(now: &MarketTime, at: NaiveTime) -> i64 {
    (now.time() - at).num_minutes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> MarketTime {
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_weekend_rolls_forward_to_next_week() {
        // Saturday 2026-03-07 and Monday 2026-03-09 share a week
        let sat = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        let mon = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let fri = NaiveDate::from_ymd_opt(2026, 3, 13).unwrap();
        assert_eq!(WeekId::for_date(sat), WeekId::for_date(mon));
        assert_eq!(WeekId::for_date(mon), WeekId::for_date(fri));
        assert_eq!(WeekId::for_date(mon).as_str(), "2026-W10");
    }

    #[test]
    fn test_week_id_strictly_increasing_across_year_end() {
        let d1 = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(WeekId::for_date(d1) < WeekId::for_date(d2));
        // Thu 2026-01-01 belongs to the week that started Mon 2025-12-29
        let d3 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(WeekId::for_date(d1), WeekId::for_date(d3));
    }

    #[test]
    fn test_week_id_parse() {
        assert!(WeekId::parse("2026-W05").is_some());
        assert!(WeekId::parse("2026-5").is_none());
        assert!(WeekId::parse("26-W05").is_none());
        assert!(WeekId::parse("2026-W99").is_none());
    }

    #[test]
    fn test_market_phases() {
        let hours = MarketHours::default();
        assert_eq!(hours.phase(&ny(2026, 3, 9, 9, 29)), SessionPhase::OffHours);
        assert_eq!(hours.phase(&ny(2026, 3, 9, 9, 30)), SessionPhase::MarketOpen);
        assert_eq!(hours.phase(&ny(2026, 3, 9, 16, 0)), SessionPhase::OffHours);
        assert_eq!(hours.phase(&ny(2026, 3, 7, 12, 0)), SessionPhase::Weekend);
    }

    #[test]
    fn test_fixed_clock_advance() {
        let clock = FixedClock::new(ny(2026, 3, 9, 9, 30));
        clock.advance(Duration::minutes(45));
        assert_eq!(clock.now().time(), NaiveTime::from_hms_opt(10, 15, 0).unwrap());
    }

    #[test]
    fn test_minutes_since() {
        let at = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        assert_eq!(minutes_since(&ny(2026, 3, 9, 10, 20), at), 20);
        assert_eq!(minutes_since(&ny(2026, 3, 9, 9, 50), at), -10);
    }
}
