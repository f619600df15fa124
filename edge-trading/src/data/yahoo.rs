//! Yahoo Finance chart/quoteSummary adapter.
//!
//! # Endpoints
//! - `/v8/finance/chart/{symbol}`: OHLCV history and the live price
//! - `/v10/finance/quoteSummary/{symbol}`: fundamentals and earnings dates
//! - `/v1/finance/search`: headlines
//!
//! Responses are cached for a minute. A symbol is remembered as unknown in
//! the [`SymbolValidationCache`] only on a 404 or an empty chart; throttling
//! and server errors are retried and never blacklist.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use edge_common::config::MarketDataConfig;

use super::cache::{SymbolValidationCache, TtlCache};
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::{clean_symbol, Bar, InstrumentInfo, MarketData, NewsItem, Period};
use crate::error::{TradingError, TradingResult};

// ============================================================================
// Constants
// ============================================================================

/// Browser User-Agent; the API answers 403 to default client strings.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_RATE_LIMIT_RPM: u32 = 120;

const SUMMARY_MODULES: &str = "price,summaryDetail,financialData,calendarEvents,earningsHistory";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Zip the parallel arrays into bars, dropping rows with gaps.
fn bars_from_chart(result: &ChartResult) -> Vec<Bar> {
    let Some(q) = result.indicators.quote.first() else {
        return Vec::new();
    };
    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    let mut bars: Vec<Bar> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            Some(Bar {
                ts: Utc.timestamp_opt(*ts, 0).single()?,
                open: at(&q.open, i)?,
                high: at(&q.high, i)?,
                low: at(&q.low, i)?,
                close: at(&q.close, i)?,
                volume: at(&q.volume, i).unwrap_or(0.0),
            })
        })
        .collect();
    bars.sort_by_key(|b| b.ts);
    bars
}

/// Read `{"raw": x}` or a bare number at `path`.
fn raw_at(value: &Value, path: &[&str]) -> Option<f64> {
    let node = path.iter().try_fold(value, |v, key| v.get(*key))?;
    node.get("raw").unwrap_or(node).as_f64()
}

fn info_from_summary(symbol: &str, summary: &Value) -> InstrumentInfo {
    InstrumentInfo {
        symbol: symbol.to_string(),
        market_cap: raw_at(summary, &["price", "marketCap"])
            .or_else(|| raw_at(summary, &["summaryDetail", "marketCap"])),
        average_volume: raw_at(summary, &["summaryDetail", "averageVolume"]),
        recommendation: summary
            .pointer("/financialData/recommendationKey")
            .and_then(Value::as_str)
            .map(str::to_string),
        target_mean_price: raw_at(summary, &["financialData", "targetMeanPrice"]),
        current_price: raw_at(summary, &["financialData", "currentPrice"])
            .or_else(|| raw_at(summary, &["price", "regularMarketPrice"])),
        analyst_count: raw_at(summary, &["financialData", "numberOfAnalystOpinions"])
            .map(|n| n as u32),
    }
}

/// Past quarters from `earningsHistory` plus upcoming from `calendarEvents`, newest first.
fn earnings_dates_from_summary(summary: &Value) -> Vec<NaiveDate> {
    let epoch_date = |secs: f64| {
        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .map(|dt| dt.date_naive())
    };

    let mut dates: Vec<NaiveDate> = Vec::new();
    if let Some(history) = summary.pointer("/earningsHistory/history").and_then(Value::as_array) {
        dates.extend(
            history
                .iter()
                .filter_map(|h| raw_at(h, &["quarter"]))
                .filter_map(epoch_date),
        );
    }
    if let Some(upcoming) = summary
        .pointer("/calendarEvents/earnings/earningsDate")
        .and_then(Value::as_array)
    {
        dates.extend(upcoming.iter().filter_map(|d| raw_at(d, &[])).filter_map(epoch_date));
    }
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.dedup();
    dates
}

fn news_from_search(body: &Value, limit: usize) -> Vec<NewsItem> {
    let Some(items) = body.get("news").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|n| {
            let headline = n.get("title")?.as_str()?.to_string();
            let published = n.get("providerPublishTime")?.as_i64()?;
            Some(NewsItem {
                headline,
                source: n
                    .get("publisher")
                    .and_then(Value::as_str)
                    .unwrap_or("yahoo")
                    .to_string(),
                published_at: Utc.timestamp_opt(published, 0).single()?,
                url: n.get("link").and_then(Value::as_str).map(str::to_string),
            })
        })
        .take(limit)
        .collect()
}

// ============================================================================
// Adapter
// ============================================================================

/// Yahoo Finance market data provider.
pub struct YahooMarketData {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    history_cache: TtlCache<Vec<Bar>>,
    price_cache: TtlCache<f64>,
    symbols: Arc<SymbolValidationCache>,
}

impl YahooMarketData {
    pub fn new(config: &MarketDataConfig, symbols: Arc<SymbolValidationCache>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::new("yahoo", DEFAULT_RATE_LIMIT_RPM)),
            retry: RetryPolicy::from_millis(config.max_attempts, config.retry_delay_ms),
            history_cache: TtlCache::new(config.cache_ttl_secs),
            price_cache: TtlCache::new(config.cache_ttl_secs),
            symbols,
        }
    }

    /// The validation cache this provider maintains.
    pub fn symbol_cache(&self) -> Arc<SymbolValidationCache> {
        self.symbols.clone()
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)], symbol: &str) -> TradingResult<Value> {
        debug!(url = %url, symbol, "Fetching from Yahoo");
        let response = self
            .retry
            .send("yahoo", &self.rate_limiter, || self.client.get(url).query(query))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TradingError::data_unavailable(symbol, "unknown symbol"));
        }
        if !status.is_success() {
            return Err(TradingError::upstream("yahoo", status.as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn fetch_chart(&self, symbol: &str, period: Period) -> TradingResult<(Vec<Bar>, Option<f64>)> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let body = self
            .get_json(
                &url,
                &[
                    ("range", period.range().to_string()),
                    ("interval", period.interval().to_string()),
                ],
                symbol,
            )
            .await?;
        let parsed: ChartResponse = serde_json::from_value(body)?;
        let result = parsed
            .chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| TradingError::data_unavailable(symbol, "empty chart"))?;
        Ok((bars_from_chart(&result), result.meta.regular_market_price))
    }

    async fn fetch_summary(&self, symbol: &str) -> TradingResult<Value> {
        let url = format!("{}/v10/finance/quoteSummary/{}", self.base_url, symbol);
        let body = self
            .get_json(&url, &[("modules", SUMMARY_MODULES.to_string())], symbol)
            .await?;
        body.pointer("/quoteSummary/result/0")
            .cloned()
            .ok_or_else(|| TradingError::data_unavailable(symbol, "empty quote summary"))
    }

    /// Clean the symbol and consult the validation cache.
    fn usable(&self, raw: &str) -> Option<String> {
        let symbol = clean_symbol(raw)?;
        (!self.symbols.is_known_bad(&symbol)).then_some(symbol)
    }
}

// ============================================================================
// MarketData Implementation
// ============================================================================

#[async_trait]
impl MarketData for YahooMarketData {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    async fn get_history(&self, raw: &str, period: Period) -> Option<Vec<Bar>> {
        let symbol = self.usable(raw)?;
        let key = format!("{}:{}", symbol, period);
        if let Some(bars) = self.history_cache.get(&key) {
            return Some(bars);
        }

        match self.fetch_chart(&symbol, period).await {
            Ok((bars, _)) if !bars.is_empty() => {
                self.symbols.mark_good(&symbol);
                self.history_cache.set(key, bars.clone());
                Some(bars)
            }
            Ok(_) => None,
            Err(e) => {
                // 404 or an empty chart; transient failures leave the symbol usable
                if matches!(e, TradingError::DataUnavailable { .. }) {
                    self.symbols.mark_bad(&symbol);
                }
                debug!(symbol = %symbol, period = %period, error = %e, "No history");
                None
            }
        }
    }

    async fn get_current_price(&self, raw: &str) -> Option<f64> {
        let symbol = self.usable(raw)?;
        if let Some(price) = self.price_cache.get(&symbol) {
            return Some(price);
        }

        match self.fetch_chart(&symbol, Period::FiveDays).await {
            Ok((bars, meta_price)) => {
                let price = meta_price
                    .or_else(|| bars.last().map(|b| b.close))
                    .filter(|p| *p > 0.0)?;
                self.symbols.mark_good(&symbol);
                self.price_cache.set(symbol, price);
                Some(price)
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "No price");
                None
            }
        }
    }

    async fn get_info(&self, raw: &str) -> Option<InstrumentInfo> {
        let symbol = self.usable(raw)?;
        match self.fetch_summary(&symbol).await {
            Ok(summary) => Some(info_from_summary(&symbol, &summary)),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "No info");
                None
            }
        }
    }

    async fn get_earnings_dates(&self, raw: &str) -> Vec<NaiveDate> {
        let Some(symbol) = self.usable(raw) else {
            return Vec::new();
        };
        match self.fetch_summary(&symbol).await {
            Ok(summary) => earnings_dates_from_summary(&summary),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "No earnings dates");
                Vec::new()
            }
        }
    }

    async fn get_news(&self, raw: &str, limit: usize) -> Vec<NewsItem> {
        let Some(symbol) = self.usable(raw) else {
            return Vec::new();
        };
        let url = format!("{}/v1/finance/search", self.base_url);
        let query = [
            ("q", symbol.clone()),
            ("newsCount", limit.to_string()),
            ("quotesCount", "0".to_string()),
        ];
        match self.get_json(&url, &query, &symbol).await {
            Ok(body) => news_from_search(&body, limit),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "No news");
                Vec::new()
            }
        }
    }
}

/// Parse an RFC 3339 or `YYYY-MM-DD HH:MM:SS` timestamp as UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chart_body() -> Value {
        json!({
            "chart": {
                "result": [{
                    "meta": {"regularMarketPrice": 187.5},
                    "timestamp": [1772805600, 1772892000, 1772978400],
                    "indicators": {"quote": [{
                        "open":   [180.0, 182.0, null],
                        "high":   [183.0, 186.0, 188.0],
                        "low":    [179.0, 181.0, 185.0],
                        "close":  [182.0, 185.0, 187.0],
                        "volume": [1000, 1200, 1500]
                    }]}
                }],
                "error": null
            }
        })
    }

    fn provider_with_attempts(server: &MockServer, max_attempts: u32) -> YahooMarketData {
        let config = MarketDataConfig {
            base_url: server.uri(),
            max_attempts,
            retry_delay_ms: 1,
            ..Default::default()
        };
        YahooMarketData::new(&config, Arc::new(SymbolValidationCache::default()))
    }

    async fn provider(server: &MockServer) -> YahooMarketData {
        provider_with_attempts(server, 3)
    }

    #[tokio::test]
    async fn test_history_skips_incomplete_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAPL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        let yahoo = provider(&server).await;
        let bars = yahoo.get_history("aapl", Period::OneMonth).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 185.0);
        assert_eq!(yahoo.get_current_price("AAPL").await, Some(187.5));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_remembered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/ZZZZ"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let yahoo = provider(&server).await;
        assert!(yahoo.get_history("ZZZZ", Period::OneYear).await.is_none());
        // Second call is answered from the validation cache
        assert!(yahoo.get_history("ZZZZ", Period::ThreeMonths).await.is_none());
        assert!(yahoo.symbol_cache().is_known_bad("ZZZZ"));
    }

    #[tokio::test]
    async fn test_server_error_does_not_blacklist_symbol() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAPL"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAPL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        // Single attempt so the 503 reaches the caller
        let yahoo = provider_with_attempts(&server, 1);
        assert!(yahoo.get_history("AAPL", Period::OneMonth).await.is_none());
        assert!(!yahoo.symbol_cache().is_known_bad("AAPL"));

        assert_eq!(yahoo.get_current_price("AAPL").await, Some(187.5));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/MSFT"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/MSFT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        let yahoo = provider(&server).await;
        let bars = yahoo.get_history("MSFT", Period::OneMonth).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_chart_marks_symbol_bad() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/GONE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"chart": {"result": [], "error": null}})))
            .mount(&server)
            .await;

        let yahoo = provider(&server).await;
        assert!(yahoo.get_history("GONE", Period::OneMonth).await.is_none());
        assert!(yahoo.symbol_cache().is_known_bad("GONE"));
    }

    #[tokio::test]
    async fn test_invalid_symbol_never_requested() {
        let server = MockServer::start().await;
        let yahoo = provider(&server).await;
        assert!(yahoo.get_current_price("12345").await.is_none());
        assert!(yahoo.get_news("BAD/SYM", 5).await.is_empty());
    }

    #[test]
    fn test_info_from_summary() {
        let summary = json!({
            "price": {"marketCap": {"raw": 2.9e12}},
            "summaryDetail": {"averageVolume": {"raw": 55_000_000.0}},
            "financialData": {
                "recommendationKey": "buy",
                "targetMeanPrice": {"raw": 210.0},
                "currentPrice": {"raw": 190.0},
                "numberOfAnalystOpinions": {"raw": 38}
            }
        });
        let info = info_from_summary("AAPL", &summary);
        assert_eq!(info.market_cap, Some(2.9e12));
        assert_eq!(info.recommendation.as_deref(), Some("buy"));
        assert_eq!(info.analyst_count, Some(38));
    }

    #[test]
    fn test_earnings_dates_newest_first() {
        let summary = json!({
            "earningsHistory": {"history": [
                {"quarter": {"raw": 1727654400}},
                {"quarter": {"raw": 1735603200}}
            ]},
            "calendarEvents": {"earnings": {"earningsDate": [{"raw": 1745971200}]}}
        });
        let dates = earnings_dates_from_summary(&summary);
        assert_eq!(dates.len(), 3);
        assert!(dates[0] > dates[1] && dates[1] > dates[2]);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-03-09T14:30:00Z").is_some());
        assert!(parse_timestamp("2026-03-09 14:30:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
