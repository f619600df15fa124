//! News monitoring for held symbols.
//!
//! Headlines are scored with keyword lexicons. The monitor runs as its own
//! task: it reads the held-symbol list the scheduler publishes and sends
//! [`NewsAdvisory`] values back over a bounded queue. It never touches
//! positions or analysis records itself.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use edge_common::config::{EarningsConfig, NewsConfig};
use edge_common::util::char_prefix;

use crate::clock::{Clock, MarketHours};
use crate::data::{MarketData, RateLimiter, RetryPolicy};
use crate::notification::{NotificationEvent, Notifier};

/// Headline characters used as the dedup key.
const DEDUP_PREFIX_CHARS: usize = 50;

/// Headlines fetched per symbol per source.
const FETCH_LIMIT: usize = 20;

// ============================================================================
// Lexicons
// ============================================================================

const POSITIVE: &[&str] = &[
    "beats", "exceeds", "raises", "upgraded", "buy", "outperform", "approval", "approved", "wins",
    "awarded", "record", "surge", "soars", "jumps", "rallies", "breakthrough", "innovation",
    "partnership", "acquisition", "dividend", "buyback", "profit",
];

const NEGATIVE: &[&str] = &[
    "misses", "disappoints", "lowers", "downgraded", "sell", "underperform", "rejection", "rejected",
    "loses", "lawsuit", "investigation", "probe", "plunges", "crashes", "tumbles", "warning", "recall",
    "fraud", "bankruptcy", "layoffs", "cuts", "loss", "decline", "weak",
];

const MATERIAL: &[&str] = &[
    "earnings", "revenue", "guidance", "outlook", "forecast", "fda", "sec", "doj", "ftc", "ceo", "cfo",
    "merger", "acquisition", "buyout", "takeover", "spin-off", "restructuring", "bankruptcy",
];

const STRONG_POSITIVE: &[&str] = &[
    "beats", "exceeds", "soars", "surges", "record", "breakthrough", "approval", "upgraded",
    "skyrockets", "blowout",
];

const MILD_POSITIVE: &[&str] = &[
    "raises", "wins", "awarded", "rallies", "partnership", "innovation", "outperform", "dividend",
    "buyback", "growth",
];

const STRONG_NEGATIVE: &[&str] = &[
    "crashes", "plunges", "fraud", "bankruptcy", "tumbles", "rejected", "probe", "investigation",
    "recall", "warning",
];

const MILD_NEGATIVE: &[&str] = &[
    "misses", "disappoints", "lowers", "downgraded", "lawsuit", "layoffs", "cuts", "loss", "decline",
    "weak", "underperform",
];

/// Direction of a headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Positive,
    Negative,
    /// Equal positive and negative hits
    Neutral,
    Unknown,
}

fn count_hits(text: &str, lexicon: &[&str]) -> usize {
    lexicon.iter().filter(|kw| text.contains(*kw)).count()
}

pub fn classify_impact(headline: &str) -> Impact {
    let text = headline.to_lowercase();
    let pos = count_hits(&text, POSITIVE);
    let neg = count_hits(&text, NEGATIVE);
    match (pos, neg) {
        (0, 0) => Impact::Unknown,
        (p, n) if p > n => Impact::Positive,
        (p, n) if n > p => Impact::Negative,
        _ => Impact::Neutral,
    }
}

/// Weighted keyword sentiment in [-1, 1].
pub fn sentiment_score(headline: &str) -> f64 {
    let text = headline.to_lowercase();
    let score = 0.4 * count_hits(&text, STRONG_POSITIVE) as f64 + 0.2 * count_hits(&text, MILD_POSITIVE) as f64
        - 0.4 * count_hits(&text, STRONG_NEGATIVE) as f64
        - 0.2 * count_hits(&text, MILD_NEGATIVE) as f64;
    score.clamp(-1.0, 1.0)
}

pub fn material_keywords(headline: &str) -> Vec<&'static str> {
    let text = headline.to_lowercase();
    MATERIAL.iter().copied().filter(|kw| text.contains(kw)).collect()
}

// ============================================================================
// Scored headlines
// ============================================================================

/// A headline with its classification.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredHeadline {
    pub symbol: String,
    pub headline: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub impact: Impact,
    pub sentiment: f64,
    pub keywords: Vec<&'static str>,
}

impl ScoredHeadline {
    pub fn score(symbol: &str, headline: &str, source: &str, published_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            headline: headline.to_string(),
            source: source.to_string(),
            published_at,
            impact: classify_impact(headline),
            sentiment: sentiment_score(headline),
            keywords: material_keywords(headline),
        }
    }

    /// Could this move a position?
    pub fn is_material(&self) -> bool {
        !self.keywords.is_empty()
            || matches!(self.impact, Impact::Positive | Impact::Negative)
            || self.sentiment.abs() >= 0.4
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", self.symbol, char_prefix(&self.headline, DEDUP_PREFIX_CHARS).to_lowercase())
    }
}

/// Aggregate read of recent headlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NewsSignal {
    Bullish,
    Bearish,
    Neutral,
    Mixed,
    NoData,
}

impl fmt::Display for NewsSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
            Self::Mixed => "MIXED",
            Self::NoData => "NO_DATA",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsReport {
    pub symbol: String,
    pub sentiment: f64,
    pub signal: NewsSignal,
    pub positive: usize,
    pub negative: usize,
    pub headlines: Vec<ScoredHeadline>,
}

impl NewsReport {
    pub fn from_headlines(symbol: &str, headlines: Vec<ScoredHeadline>) -> Self {
        if headlines.is_empty() {
            return Self {
                symbol: symbol.to_string(),
                sentiment: 0.0,
                signal: NewsSignal::NoData,
                positive: 0,
                negative: 0,
                headlines,
            };
        }
        let avg = headlines.iter().map(|h| h.sentiment).sum::<f64>() / headlines.len() as f64;
        let positive = headlines.iter().filter(|h| h.impact == Impact::Positive).count();
        let negative = headlines.iter().filter(|h| h.impact == Impact::Negative).count();

        let signal = if avg > 0.3 && positive > negative * 2 {
            NewsSignal::Bullish
        } else if avg < -0.3 && negative > positive * 2 {
            NewsSignal::Bearish
        } else if avg.abs() < 0.1 {
            NewsSignal::Neutral
        } else {
            NewsSignal::Mixed
        };

        Self {
            symbol: symbol.to_string(),
            sentiment: avg,
            signal,
            positive,
            negative,
            headlines,
        }
    }
}

// ============================================================================
// Advisories
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
}

/// "Review this position" hint for the scheduler. Never acts on its own.
#[derive(Debug, Clone, Serialize)]
pub struct NewsAdvisory {
    pub symbol: String,
    pub urgency: Urgency,
    pub headline: String,
    pub sentiment: f64,
}

// ============================================================================
// FMP news (optional second source)
// ============================================================================

struct FmpNews {
    client: reqwest::Client,
    urls: [String; 2],
    api_key: String,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
}

impl FmpNews {
    fn from_config(config: &EarningsConfig) -> Option<Self> {
        let api_key = config.fmp_api_key.as_deref().filter(|k| !k.is_empty())?;
        let base = config.fmp_base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Some(Self {
            client,
            urls: [
                format!("{}/stable/news/stock-news", base),
                format!("{}/api/v3/stock_news", base),
            ],
            api_key: api_key.to_string(),
            rate_limiter: RateLimiter::new("fmp-news", 240),
            retry: RetryPolicy::from_millis(config.max_attempts, config.retry_delay_ms),
        })
    }

    /// First endpoint that returns rows wins. Failures read as "no news".
    async fn fetch(&self, symbol: &str) -> Vec<ScoredHeadline> {
        let query = [
            ("tickers", symbol.to_string()),
            ("limit", FETCH_LIMIT.to_string()),
            ("apikey", self.api_key.clone()),
        ];
        for url in &self.urls {
            let response = self
                .retry
                .send("fmp/news", &self.rate_limiter, || self.client.get(url).query(&query))
                .await;
            let body: Value = match response {
                Ok(r) if r.status().is_success() => match r.json().await {
                    Ok(v) => v,
                    Err(_) => continue,
                },
                Ok(_) => continue,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "FMP news request failed");
                    continue;
                }
            };
            let items: Vec<ScoredHeadline> = body
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let title = row.get("title")?.as_str()?;
                            let published = row
                                .get("publishedDate")
                                .and_then(Value::as_str)
                                .and_then(parse_fmp_time)
                                .unwrap_or_else(Utc::now);
                            let site = row.get("site").and_then(Value::as_str).unwrap_or("FMP");
                            Some(ScoredHeadline::score(symbol, title, site, published))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if !items.is_empty() {
                return items;
            }
        }
        Vec::new()
    }
}

fn parse_fmp_time(value: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|dt| dt.and_utc())
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct MonitorState {
    seen: HashSet<String>,
    last_check: HashMap<String, DateTime<Utc>>,
    cache: HashMap<String, Vec<ScoredHeadline>>,
}

/// Polls news for a set of symbols.
pub struct NewsMonitor {
    data: Arc<dyn MarketData>,
    fmp: Option<FmpNews>,
    config: NewsConfig,
    state: Mutex<MonitorState>,
}

impl NewsMonitor {
    pub fn new(data: Arc<dyn MarketData>, config: NewsConfig) -> Self {
        Self {
            data,
            fmp: None,
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Add FMP stock news when an API key is configured.
    pub fn with_fmp(mut self, earnings: &EarningsConfig) -> Self {
        self.fmp = FmpNews::from_config(earnings);
        self
    }

    /// Recent, deduplicated, unseen headlines for `symbol`, newest first.
    ///
    /// Within the throttle window the previous result is returned without
    /// fetching. Headlines are marked seen so later polls only surface new ones.
    pub async fn check_news(&self, symbol: &str, now: DateTime<Utc>) -> Vec<ScoredHeadline> {
        {
            let state = self.state.lock().await;
            if let Some(last) = state.last_check.get(symbol) {
                if (now - *last).num_seconds() < self.config.throttle_secs {
                    return state.cache.get(symbol).cloned().unwrap_or_default();
                }
            }
        }

        let mut fetched: Vec<ScoredHeadline> = self
            .data
            .get_news(symbol, FETCH_LIMIT)
            .await
            .into_iter()
            .map(|item| ScoredHeadline::score(symbol, &item.headline, &item.source, item.published_at))
            .collect();
        if let Some(fmp) = &self.fmp {
            fetched.extend(fmp.fetch(symbol).await);
        }

        let cutoff = now - ChronoDuration::hours(self.config.max_age_hours);
        let mut state = self.state.lock().await;
        let mut keys = HashSet::new();
        let mut fresh: Vec<ScoredHeadline> = fetched
            .into_iter()
            .filter(|h| !h.headline.trim().is_empty() && h.published_at > cutoff)
            .filter(|h| {
                let key = h.dedup_key();
                !state.seen.contains(&key) && keys.insert(key)
            })
            .collect();
        fresh.sort_by(|a, b| b.published_at.cmp(&a.published_at));

        state.seen.extend(keys);
        state.last_check.insert(symbol.to_string(), now);
        state.cache.insert(symbol.to_string(), fresh.clone());
        fresh
    }

    /// Aggregate report over the last day of headlines. Ignores the seen set.
    pub async fn report(&self, symbol: &str, now: DateTime<Utc>) -> NewsReport {
        let cutoff = now - ChronoDuration::hours(self.config.max_age_hours);
        let mut keys = HashSet::new();
        let headlines: Vec<ScoredHeadline> = self
            .data
            .get_news(symbol, FETCH_LIMIT)
            .await
            .into_iter()
            .filter(|item| item.published_at > cutoff)
            .map(|item| ScoredHeadline::score(symbol, &item.headline, &item.source, item.published_at))
            .filter(|h| keys.insert(h.dedup_key()))
            .collect();
        NewsReport::from_headlines(symbol, headlines)
    }

    /// Negative material news within the alert window becomes an advisory.
    pub async fn check_position(&self, symbol: &str, now: DateTime<Utc>) -> Option<NewsAdvisory> {
        self.check_news(symbol, now).await.into_iter().find_map(|h| {
            let age = (now - h.published_at).num_minutes();
            let relevant = h.impact == Impact::Negative && h.is_material() && age < self.config.alert_window_minutes;
            relevant.then(|| NewsAdvisory {
                symbol: symbol.to_string(),
                urgency: if age < self.config.high_urgency_minutes {
                    Urgency::High
                } else {
                    Urgency::Medium
                },
                headline: h.headline,
                sentiment: h.sentiment,
            })
        })
    }

    /// Poll held symbols during market hours until the scheduler goes away.
    pub async fn run(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        hours: MarketHours,
        held: watch::Receiver<Vec<String>>,
        advisories: mpsc::Sender<NewsAdvisory>,
        notifier: Notifier,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        info!("News monitor started");

        loop {
            interval.tick().await;
            if advisories.is_closed() {
                break;
            }
            if !hours.is_open(&clock.now()) {
                continue;
            }

            let symbols = held.borrow().clone();
            for symbol in symbols {
                let now = clock.now().with_timezone(&Utc);
                let Some(advisory) = self.check_position(&symbol, now).await else {
                    continue;
                };
                notifier.notify(NotificationEvent::NewsAlert {
                    symbol: advisory.symbol.clone(),
                    headline: advisory.headline.clone(),
                    sentiment: advisory.sentiment,
                });
                if let Err(e) = advisories.try_send(advisory) {
                    warn!(symbol = %symbol, error = %e, "Advisory queue full, dropping");
                }
            }
        }
        info!("News monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryMarketData, NewsItem};

    fn item(headline: &str, published_at: DateTime<Utc>) -> NewsItem {
        NewsItem {
            headline: headline.into(),
            source: "wire".into(),
            published_at,
            url: None,
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-03-10T15:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_sentiment_weights_and_clamp() {
        assert!((sentiment_score("Apple beats estimates") - 0.4).abs() < 1e-9);
        assert!((sentiment_score("Company raises dividend") - 0.4).abs() < 1e-9);
        assert!((sentiment_score("Shares tumbles on fraud probe") + 1.0).abs() < 1e-9);
        assert_eq!(sentiment_score("Quarterly filing released"), 0.0);
    }

    #[test]
    fn test_impact_classification() {
        assert_eq!(classify_impact("Analyst upgraded to buy"), Impact::Positive);
        assert_eq!(classify_impact("Revenue misses, guidance lowers"), Impact::Negative);
        assert_eq!(classify_impact("Nothing to see"), Impact::Unknown);
    }

    #[test]
    fn test_report_signal() {
        let t = now();
        let bullish = NewsReport::from_headlines(
            "AAPL",
            vec![
                ScoredHeadline::score("AAPL", "Apple beats and soars to record", "x", t),
                ScoredHeadline::score("AAPL", "Apple upgraded after breakthrough", "x", t),
            ],
        );
        assert_eq!(bullish.signal, NewsSignal::Bullish);
        assert_eq!(NewsReport::from_headlines("AAPL", vec![]).signal, NewsSignal::NoData);
    }

    #[tokio::test]
    async fn test_dedup_throttle_and_seen() {
        let data = Arc::new(InMemoryMarketData::new());
        let t = now();
        data.set_news(
            "AAPL",
            vec![
                item("Apple faces lawsuit over App Store fees and developer terms in EU", t),
                item("Apple faces lawsuit over App Store fees and developer terms in US", t),
                item("Old story", t - ChronoDuration::hours(30)),
            ],
        );
        let monitor = NewsMonitor::new(data, NewsConfig::default());

        let first = monitor.check_news("AAPL", t).await;
        assert_eq!(first.len(), 1);

        // Throttled: cached result
        let cached = monitor.check_news("AAPL", t + ChronoDuration::seconds(10)).await;
        assert_eq!(cached.len(), 1);

        // After the throttle the same headline is already seen
        let later = monitor.check_news("AAPL", t + ChronoDuration::seconds(120)).await;
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_position_advisory_urgency() {
        let data = Arc::new(InMemoryMarketData::new());
        let t = now();
        data.set_news("MSFT", vec![item("SEC opens investigation into Microsoft", t - ChronoDuration::minutes(5))]);
        data.set_news("NVDA", vec![item("Nvidia CEO warning on guidance", t - ChronoDuration::minutes(20))]);
        data.set_news("AMD", vec![item("AMD earnings misses", t - ChronoDuration::minutes(45))]);
        let monitor = NewsMonitor::new(data, NewsConfig::default());

        let high = monitor.check_position("MSFT", t).await.unwrap();
        assert_eq!(high.urgency, Urgency::High);
        let medium = monitor.check_position("NVDA", t).await.unwrap();
        assert_eq!(medium.urgency, Urgency::Medium);
        assert!(monitor.check_position("AMD", t).await.is_none());
    }
}
