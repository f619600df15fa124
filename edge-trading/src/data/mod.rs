//! Market data layer.
//!
//! Every provider method returns an explicit "no data" value (`None` or an
//! empty `Vec`) instead of an error. Callers treat that as "skip this
//! symbol", never as zero.

pub mod cache;
pub mod calendar;
pub mod memory;
pub mod rate_limiter;
pub mod retry;
pub mod yahoo;

pub use cache::{CacheStats, SymbolValidationCache, TtlCache};
pub use calendar::{CalendarSource, EarningsCalendar};
pub use memory::InMemoryMarketData;
pub use rate_limiter::{EndpointSpacing, RateLimiter};
pub use retry::RetryPolicy;
pub use yahoo::YahooMarketData;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::New_York;

// ============================================================================
// Core Data Types
// ============================================================================

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Exchange-local calendar date of this bar.
    pub fn date(&self) -> NaiveDate {
        self.ts.with_timezone(&New_York).date_naive()
    }

    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// History lookback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    /// Five daily bars
    FiveDays,
    OneMonth,
    ThreeMonths,
    OneYear,
    TwoYears,
    /// Today's 5-minute bars
    Intraday,
}

impl Period {
    /// Chart API `range` parameter.
    pub fn range(&self) -> &'static str {
        match self {
            Self::FiveDays => "5d",
            Self::OneMonth => "1mo",
            Self::ThreeMonths => "3mo",
            Self::OneYear => "1y",
            Self::TwoYears => "2y",
            Self::Intraday => "1d",
        }
    }

    /// Chart API `interval` parameter.
    pub fn interval(&self) -> &'static str {
        match self {
            Self::Intraday => "5m",
            _ => "1d",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.range(), self.interval())
    }
}

/// Fundamentals snapshot for a symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub market_cap: Option<f64>,
    pub average_volume: Option<f64>,
    /// e.g. "buy", "strong_buy", "hold"
    pub recommendation: Option<String>,
    pub target_mean_price: Option<f64>,
    pub current_price: Option<f64>,
    pub analyst_count: Option<u32>,
}

/// A news headline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub headline: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
}

/// When an earnings release happens relative to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseTime {
    /// Before market open
    Bmo,
    /// After market close
    Amc,
    Unknown,
}

impl ReleaseTime {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "bmo" | "pre-market" | "before market open" => Self::Bmo,
            "amc" | "after-hours" | "after market close" => Self::Amc,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bmo => "bmo",
            Self::Amc => "amc",
            Self::Unknown => "unknown",
        }
    }
}

/// One upcoming earnings release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsEvent {
    pub symbol: String,
    pub date: NaiveDate,
    pub time: ReleaseTime,
    pub eps_estimate: Option<f64>,
    pub revenue_estimate: Option<f64>,
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Market data source.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Bars oldest-first, `None` when nothing usable came back.
    async fn get_history(&self, symbol: &str, period: Period) -> Option<Vec<Bar>>;

    async fn get_current_price(&self, symbol: &str) -> Option<f64>;

    async fn get_info(&self, symbol: &str) -> Option<InstrumentInfo>;

    /// Past and scheduled earnings dates, newest first.
    async fn get_earnings_dates(&self, symbol: &str) -> Vec<NaiveDate>;

    /// Newest first, at most `limit`.
    async fn get_news(&self, symbol: &str, limit: usize) -> Vec<NewsItem>;
}

// ============================================================================
// Symbol Cleaning
// ============================================================================

/// Normalise a raw ticker. Returns `None` for anything that is not a plain
/// US equity symbol (leading digit, longer than five, odd characters).
pub fn clean_symbol(raw: &str) -> Option<String> {
    let symbol = raw.replace('$', "").trim().to_uppercase().replace('.', "-");
    if symbol.is_empty() || symbol.len() > 5 {
        return None;
    }
    if symbol.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    Some(symbol)
}
