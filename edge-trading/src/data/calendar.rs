//! Earnings calendar with a fallback chain.
//!
//! Sources are tried in order (primary, legacy, scraped); the first that
//! returns a non-empty list wins. A failing source is logged and skipped.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use edge_common::config::EarningsConfig;

use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::{EarningsEvent, MarketData, ReleaseTime};
use crate::error::{TradingError, TradingResult};

/// Upper bound on per-symbol lookups when scraping.
const MAX_SCRAPED_SYMBOLS: usize = 500;

const FMP_TIMEOUT_SECS: u64 = 30;

/// Which link of the chain produced a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarSource {
    Primary,
    Legacy,
    Scraped,
}

impl fmt::Display for CalendarSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Legacy => "legacy",
            Self::Scraped => "scraped",
        };
        f.write_str(s)
    }
}

/// One link in the chain.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn source(&self) -> CalendarSource;

    /// Events dated within `[from, to]`. Symbols are returned raw.
    async fn fetch(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        universe: &[String],
    ) -> TradingResult<Vec<EarningsEvent>>;
}

// ============================================================================
// Financial Modeling Prep
// ============================================================================

/// FMP earnings calendar (current or legacy endpoint).
pub struct FmpCalendar {
    client: reqwest::Client,
    url: String,
    api_key: String,
    source: CalendarSource,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl FmpCalendar {
    fn with_path(config: &EarningsConfig, api_key: &str, path: &str, source: CalendarSource) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FMP_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: format!("{}{}", config.fmp_base_url.trim_end_matches('/'), path),
            api_key: api_key.to_string(),
            source,
            rate_limiter: Arc::new(RateLimiter::new("fmp", 240)),
            retry: RetryPolicy::from_millis(config.max_attempts, config.retry_delay_ms),
        }
    }

    pub fn primary(config: &EarningsConfig, api_key: &str) -> Self {
        Self::with_path(config, api_key, "/stable/earnings-calendar", CalendarSource::Primary)
    }

    pub fn legacy(config: &EarningsConfig, api_key: &str) -> Self {
        Self::with_path(config, api_key, "/api/v3/earning_calendar", CalendarSource::Legacy)
    }
}

/// Parse FMP calendar rows. Rows without a symbol or a date are dropped.
fn parse_fmp_rows(body: &Value) -> Vec<EarningsEvent> {
    let Some(rows) = body.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let symbol = row.get("symbol")?.as_str()?.to_string();
            let date = NaiveDate::parse_from_str(row.get("date")?.as_str()?, "%Y-%m-%d").ok()?;
            Some(EarningsEvent {
                symbol,
                date,
                time: row
                    .get("time")
                    .and_then(Value::as_str)
                    .map_or(ReleaseTime::Unknown, ReleaseTime::parse),
                eps_estimate: row.get("epsEstimated").and_then(Value::as_f64),
                revenue_estimate: row.get("revenueEstimated").and_then(Value::as_f64),
            })
        })
        .collect()
}

#[async_trait]
impl CalendarProvider for FmpCalendar {
    fn source(&self) -> CalendarSource {
        self.source
    }

    async fn fetch(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        _universe: &[String],
    ) -> TradingResult<Vec<EarningsEvent>> {
        let query = [
            ("from", from.format("%Y-%m-%d").to_string()),
            ("to", to.format("%Y-%m-%d").to_string()),
            ("apikey", self.api_key.clone()),
        ];
        let endpoint = format!("fmp/{}", self.source);
        let response = self
            .retry
            .send(&endpoint, &self.rate_limiter, || self.client.get(&self.url).query(&query))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TradingError::Auth(format!("FMP {} endpoint: HTTP {}", self.source, status)));
        }
        if !status.is_success() {
            return Err(TradingError::upstream(endpoint, status.as_u16()));
        }

        let body: Value = response.json().await?;
        Ok(parse_fmp_rows(&body)
            .into_iter()
            .filter(|e| e.date >= from && e.date <= to)
            .collect())
    }
}

// ============================================================================
// Scraped (per-symbol)
// ============================================================================

/// Last resort: ask the market data provider for each universe symbol's next date.
pub struct ScrapedCalendar {
    data: Arc<dyn MarketData>,
}

impl ScrapedCalendar {
    pub fn new(data: Arc<dyn MarketData>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl CalendarProvider for ScrapedCalendar {
    fn source(&self) -> CalendarSource {
        CalendarSource::Scraped
    }

    async fn fetch(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        universe: &[String],
    ) -> TradingResult<Vec<EarningsEvent>> {
        let mut events = Vec::new();
        for symbol in universe.iter().take(MAX_SCRAPED_SYMBOLS) {
            let dates = self.data.get_earnings_dates(symbol).await;
            if let Some(date) = dates.into_iter().find(|d| *d >= from && *d <= to) {
                events.push(EarningsEvent {
                    symbol: symbol.clone(),
                    date,
                    time: ReleaseTime::Unknown,
                    eps_estimate: None,
                    revenue_estimate: None,
                });
            }
        }
        debug!(checked = universe.len().min(MAX_SCRAPED_SYMBOLS), found = events.len(), "Scraped calendar");
        Ok(events)
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Ordered fallback chain of calendar sources.
pub struct EarningsCalendar {
    providers: Vec<Box<dyn CalendarProvider>>,
}

impl EarningsCalendar {
    pub fn new(providers: Vec<Box<dyn CalendarProvider>>) -> Self {
        Self { providers }
    }

    /// Primary and legacy FMP when a key is configured, scraping always last.
    pub fn from_config(config: &EarningsConfig, data: Arc<dyn MarketData>) -> Self {
        let mut providers: Vec<Box<dyn CalendarProvider>> = Vec::new();
        if let Some(key) = config.fmp_api_key.as_deref().filter(|k| !k.is_empty()) {
            providers.push(Box::new(FmpCalendar::primary(config, key)));
            providers.push(Box::new(FmpCalendar::legacy(config, key)));
        } else {
            warn!("FMP_API_KEY not set, earnings calendar falls back to scraping");
        }
        providers.push(Box::new(ScrapedCalendar::new(data)));
        Self::new(providers)
    }

    /// First non-empty result in chain order, or `None` if every source came back empty.
    pub async fn fetch(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        universe: &[String],
    ) -> Option<(CalendarSource, Vec<EarningsEvent>)> {
        for provider in &self.providers {
            match provider.fetch(from, to, universe).await {
                Ok(events) if !events.is_empty() => {
                    info!(source = %provider.source(), count = events.len(), "Earnings calendar fetched");
                    return Some((provider.source(), events));
                }
                Ok(_) => {
                    debug!(source = %provider.source(), "Calendar source returned nothing, falling back");
                }
                Err(e) => {
                    warn!(source = %provider.source(), error = %e, "Calendar source failed, falling back");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    struct Fixed(CalendarSource, TradingResult<Vec<EarningsEvent>>);

    #[async_trait]
    impl CalendarProvider for Fixed {
        fn source(&self) -> CalendarSource {
            self.0
        }

        async fn fetch(&self, _: NaiveDate, _: NaiveDate, _: &[String]) -> TradingResult<Vec<EarningsEvent>> {
            match &self.1 {
                Ok(v) => Ok(v.clone()),
                Err(_) => Err(TradingError::Broker("down".into())),
            }
        }
    }

    fn event(symbol: &str) -> EarningsEvent {
        EarningsEvent {
            symbol: symbol.into(),
            date: day(10),
            time: ReleaseTime::Amc,
            eps_estimate: None,
            revenue_estimate: None,
        }
    }

    #[tokio::test]
    async fn test_chain_falls_back_on_error_and_empty() {
        let chain = EarningsCalendar::new(vec![
            Box::new(Fixed(CalendarSource::Primary, Err(TradingError::Broker("x".into())))),
            Box::new(Fixed(CalendarSource::Legacy, Ok(vec![]))),
            Box::new(Fixed(CalendarSource::Scraped, Ok(vec![event("AAPL")]))),
        ]);
        let (source, events) = chain.fetch(day(9), day(13), &[]).await.unwrap();
        assert_eq!(source, CalendarSource::Scraped);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_success() {
        let chain = EarningsCalendar::new(vec![
            Box::new(Fixed(CalendarSource::Primary, Ok(vec![event("MSFT")]))),
            Box::new(Fixed(CalendarSource::Legacy, Ok(vec![event("AAPL")]))),
        ]);
        let (source, events) = chain.fetch(day(9), day(13), &[]).await.unwrap();
        assert_eq!(source, CalendarSource::Primary);
        assert_eq!(events[0].symbol, "MSFT");
    }

    #[tokio::test]
    async fn test_chain_all_empty() {
        let chain = EarningsCalendar::new(vec![Box::new(Fixed(CalendarSource::Primary, Ok(vec![])))]);
        assert!(chain.fetch(day(9), day(13), &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_fmp_legacy_parses_and_filters_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/earning_calendar"))
            .and(query_param("from", "2026-03-09"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "AAPL", "date": "2026-03-10", "time": "amc", "epsEstimated": 1.5},
                {"symbol": "MSFT", "date": "2026-03-20", "time": "bmo"},
                {"date": "2026-03-11"}
            ])))
            .mount(&server)
            .await;

        let config = EarningsConfig {
            fmp_base_url: server.uri(),
            ..Default::default()
        };
        let fmp = FmpCalendar::legacy(&config, "key");
        let events = fmp.fetch(day(9), day(13), &[]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "AAPL");
        assert_eq!(events[0].time, ReleaseTime::Amc);
        assert_eq!(events[0].eps_estimate, Some(1.5));
    }

    #[tokio::test]
    async fn test_fmp_retries_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stable/earnings-calendar"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/earnings-calendar"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "NVDA", "date": "2026-03-11", "time": "amc"}
            ])))
            .mount(&server)
            .await;

        let config = EarningsConfig {
            fmp_base_url: server.uri(),
            retry_delay_ms: 1,
            ..Default::default()
        };
        let events = FmpCalendar::primary(&config, "key").fetch(day(9), day(13), &[]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "NVDA");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fmp_server_error_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;
        let config = EarningsConfig {
            fmp_base_url: server.uri(),
            max_attempts: 2,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let err = FmpCalendar::legacy(&config, "key").fetch(day(9), day(13), &[]).await.unwrap_err();
        assert!(matches!(err, TradingError::Upstream { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_fmp_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let config = EarningsConfig {
            fmp_base_url: server.uri(),
            ..Default::default()
        };
        let err = FmpCalendar::primary(&config, "bad").fetch(day(9), day(13), &[]).await.unwrap_err();
        assert!(matches!(err, TradingError::Auth(_)));
    }
}
