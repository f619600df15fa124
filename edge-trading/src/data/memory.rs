//! In-memory market data, for replays and tests.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{Bar, InstrumentInfo, MarketData, NewsItem, Period};
use crate::clock::New_York;

#[derive(Debug, Default)]
struct Tables {
    history: HashMap<(String, Period), Vec<Bar>>,
    prices: HashMap<String, f64>,
    info: HashMap<String, InstrumentInfo>,
    earnings: HashMap<String, Vec<NaiveDate>>,
    news: HashMap<String, Vec<NewsItem>>,
}

/// Provider backed by fixed tables. Missing entries read as "no data".
#[derive(Debug, Default)]
pub struct InMemoryMarketData {
    tables: RwLock<Tables>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, f: impl FnOnce(&mut Tables)) {
        if let Ok(mut t) = self.tables.write() {
            f(&mut t);
        }
    }

    pub fn set_history(&self, symbol: &str, period: Period, bars: Vec<Bar>) {
        self.write(|t| {
            t.history.insert((symbol.to_string(), period), bars);
        });
    }

    /// Same bars for every daily period.
    pub fn set_daily(&self, symbol: &str, bars: Vec<Bar>) {
        for period in [
            Period::FiveDays,
            Period::OneMonth,
            Period::ThreeMonths,
            Period::OneYear,
            Period::TwoYears,
        ] {
            self.set_history(symbol, period, bars.clone());
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.write(|t| {
            t.prices.insert(symbol.to_string(), price);
        });
    }

    pub fn set_info(&self, info: InstrumentInfo) {
        self.write(|t| {
            t.info.insert(info.symbol.clone(), info);
        });
    }

    pub fn set_earnings_dates(&self, symbol: &str, dates: Vec<NaiveDate>) {
        self.write(|t| {
            t.earnings.insert(symbol.to_string(), dates);
        });
    }

    pub fn set_news(&self, symbol: &str, items: Vec<NewsItem>) {
        self.write(|t| {
            t.news.insert(symbol.to_string(), items);
        });
    }
}

#[async_trait]
impl MarketData for InMemoryMarketData {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_history(&self, symbol: &str, period: Period) -> Option<Vec<Bar>> {
        let t = self.tables.read().ok()?;
        t.history
            .get(&(symbol.to_string(), period))
            .filter(|bars| !bars.is_empty())
            .cloned()
    }

    async fn get_current_price(&self, symbol: &str) -> Option<f64> {
        let t = self.tables.read().ok()?;
        if let Some(p) = t.prices.get(symbol) {
            return Some(*p);
        }
        t.history
            .get(&(symbol.to_string(), Period::OneMonth))
            .and_then(|bars| bars.last())
            .map(|b| b.close)
    }

    async fn get_info(&self, symbol: &str) -> Option<InstrumentInfo> {
        self.tables.read().ok()?.info.get(symbol).cloned()
    }

    async fn get_earnings_dates(&self, symbol: &str) -> Vec<NaiveDate> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.earnings.get(symbol).cloned())
            .unwrap_or_default()
    }

    async fn get_news(&self, symbol: &str, limit: usize) -> Vec<NewsItem> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.news.get(symbol).cloned())
            .map(|mut items| {
                items.truncate(limit);
                items
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Bar builders
// ============================================================================

/// One daily bar at the 09:30 New York open of `date`.
pub fn daily_bar(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
    let ts = New_York
        .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN)))
        .single()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc());
    Bar {
        ts,
        open,
        high,
        low,
        close,
        volume,
    }
}

/// Consecutive weekday bars ending on `last`, one per close. Open equals
/// the prior close; high and low bracket the body by half a percent.
pub fn daily_series(last: NaiveDate, closes: &[f64], volume: f64) -> Vec<Bar> {
    let mut dates = Vec::with_capacity(closes.len());
    let mut d = last;
    while dates.len() < closes.len() {
        if crate::clock::is_weekday(d) {
            dates.push(d);
        }
        d -= Duration::days(1);
    }
    dates.reverse();

    let mut prev = closes.first().copied().unwrap_or(0.0);
    dates
        .into_iter()
        .zip(closes)
        .map(|(date, &close)| {
            let bar = daily_bar(
                date,
                prev,
                prev.max(close) * 1.005,
                prev.min(close) * 0.995,
                close,
                volume,
            );
            prev = close;
            bar
        })
        .collect()
}

/// Five-minute bars for `date` starting at the open.
pub fn intraday_series(date: NaiveDate, prices: &[(f64, f64)]) -> Vec<Bar> {
    let open = daily_bar(date, 0.0, 0.0, 0.0, 0.0, 0.0).ts;
    prices
        .iter()
        .enumerate()
        .map(|(i, &(price, volume))| Bar {
            ts: open + Duration::minutes(5 * i as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use chrono::Datelike;

    #[tokio::test]
    async fn test_missing_reads_as_no_data() {
        let md = InMemoryMarketData::new();
        assert!(md.get_history("AAPL", Period::OneYear).await.is_none());
        assert!(md.get_current_price("AAPL").await.is_none());
        assert!(md.get_earnings_dates("AAPL").await.is_empty());
    }

    #[tokio::test]
    async fn test_price_falls_back_to_last_close() {
        let md = InMemoryMarketData::new();
        let last = NaiveDate::from_ymd_opt(2026, 3, 13).unwrap();
        md.set_daily("AAPL", daily_series(last, &[1.0, 2.0, 3.0], 100.0));
        assert_eq!(md.get_current_price("AAPL").await, Some(3.0));
        md.set_price("AAPL", 4.0);
        assert_eq!(md.get_current_price("AAPL").await, Some(4.0));
    }

    #[test]
    fn test_daily_series_skips_weekends() {
        let last = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(); // Monday
        let bars = daily_series(last, &[1.0, 2.0], 0.0);
        assert_eq!(bars[0].date().weekday(), Weekday::Fri);
        assert_eq!(bars[1].date(), last);
    }
}
