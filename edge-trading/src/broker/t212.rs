//! Trading 212 REST adapter.
//!
//! Basic auth with `base64(key:secret)`. Every endpoint has its own minimum
//! spacing between calls; requests are retried a bounded number of times on
//! 429, 5xx and transport errors.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use edge_common::config::BrokerConfig;

use super::{
    round_quantity, symbol_from_ticker, AccountInfo, Broker, BrokerPosition, Instrument, OrderResult,
};
use crate::data::{clean_symbol, EndpointSpacing};
use crate::error::{TradingError, TradingResult};
use crate::strategy::Direction;

pub const DEMO_URL: &str = "https://demo.trading212.com/api/v0";
pub const LIVE_URL: &str = "https://live.trading212.com/api/v0";

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Minimum spacing per endpoint, as published by the API.
fn default_spacing() -> EndpointSpacing {
    EndpointSpacing::new(Duration::from_secs(2))
        .with_interval("account", Duration::from_secs(6))
        .with_interval("instruments", Duration::from_secs(55))
        .with_interval("positions", Duration::from_secs(2))
        .with_interval("orders", Duration::from_secs(6))
        .with_interval("market_order", Duration::from_secs(2))
}

fn f64_at(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn str_at(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Trading 212 broker.
pub struct Trading212Broker {
    client: reqwest::Client,
    base_url: String,
    auth_header: String,
    spacing: EndpointSpacing,
    max_attempts: u32,
    retry_delay: Duration,
    rate_limit_delay: Duration,
    /// Keyed by both ticker and symbol
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl Trading212Broker {
    pub fn new(base_url: impl Into<String>, api_key: &str, api_secret: &str) -> Self {
        let credentials = format!("{}:{}", api_key, api_secret);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: format!("Basic {}", encoded),
            spacing: default_spacing(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(5),
            rate_limit_delay: Duration::from_secs(60),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    /// Demo account in paper mode, live otherwise. A configured base URL wins.
    pub fn from_config(config: &BrokerConfig, paper: bool) -> TradingResult<Self> {
        let (Some(key), Some(secret)) = (config.api_key.as_deref(), config.api_secret.as_deref()) else {
            return Err(TradingError::Configuration("broker credentials missing".into()));
        };
        let url = config
            .base_url
            .clone()
            .unwrap_or_else(|| if paper { DEMO_URL } else { LIVE_URL }.to_string());

        let mut broker = Self::new(url, key, secret);
        if let Some(secs) = config.timeout_secs {
            broker.client = reqwest::Client::builder()
                .timeout(Duration::from_secs(secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new());
        }
        if let Some(attempts) = config.max_attempts {
            broker.max_attempts = attempts.max(1);
        }
        info!(env = if paper { "demo" } else { "live" }, "Trading 212 client initialized");
        Ok(broker)
    }

    pub fn with_spacing(mut self, spacing: EndpointSpacing) -> Self {
        self.spacing = spacing;
        self
    }

    /// Backoff after a transient failure and after a 429.
    pub fn with_retry_delays(mut self, retry: Duration, rate_limited: Duration) -> Self {
        self.retry_delay = retry;
        self.rate_limit_delay = rate_limited;
        self
    }

    /// `Ok(None)` for 204 responses.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        endpoint: &'static str,
        body: Option<&Value>,
    ) -> TradingResult<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = TradingError::Broker(format!("{} not attempted", endpoint));

        for attempt in 1..=self.max_attempts {
            self.spacing.wait(endpoint).await;
            debug!(endpoint, attempt, "Broker request");

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", &self.auth_header);
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    let e = TradingError::from(e);
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(endpoint, attempt, error = %e, "Broker request failed, retrying");
                    last_error = e;
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            let status = response.status();
            match status.as_u16() {
                200 | 201 => {
                    let text = response.text().await?;
                    if text.trim().is_empty() {
                        return Ok(Some(Value::Null));
                    }
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                204 => return Ok(None),
                401 | 403 => {
                    return Err(TradingError::Auth(format!("{} returned {}", endpoint, status)));
                }
                429 => {
                    warn!(endpoint, attempt, "Broker rate limited, backing off");
                    last_error = TradingError::RateLimited {
                        endpoint: endpoint.to_string(),
                        retry_after_secs: self.rate_limit_delay.as_secs(),
                    };
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.rate_limit_delay).await;
                    }
                }
                s if s >= 500 => {
                    let text = response.text().await.unwrap_or_default();
                    warn!(endpoint, attempt, status = s, "Broker server error");
                    last_error = TradingError::Broker(format!("HTTP {}: {}", status, text));
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                _ => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(TradingError::rejected(endpoint, format!("HTTP {}: {}", status, text)));
                }
            }
        }
        Err(last_error)
    }

    async fn get(&self, path: &str, endpoint: &'static str) -> TradingResult<Value> {
        Ok(self
            .request(reqwest::Method::GET, path, endpoint, None)
            .await?
            .unwrap_or(Value::Null))
    }

    /// Broker ticker for a symbol: catalogue first, then the usual suffixes.
    async fn ticker_for(&self, symbol: &str) -> TradingResult<Option<String>> {
        let Some(symbol) = clean_symbol(symbol) else {
            return Ok(None);
        };
        if self.instruments.read().await.is_empty() {
            self.instruments().await?;
        }
        let map = self.instruments.read().await;
        if let Some(i) = map.get(&symbol) {
            return Ok(Some(i.ticker.clone()));
        }
        Ok([format!("{}_US_EQ", symbol), format!("{}_EQ", symbol)]
            .into_iter()
            .find(|t| map.contains_key(t)))
    }

    async fn market_order(&self, symbol: &str, quantity: f64, side: Direction) -> TradingResult<OrderResult> {
        let ticker = self
            .ticker_for(symbol)
            .await?
            .ok_or_else(|| TradingError::rejected(symbol, "not tradeable"))?;
        let qty = round_quantity(quantity)
            .ok_or_else(|| TradingError::rejected(symbol, format!("quantity too small ({:.4})", quantity)))?;
        let signed = if side == Direction::Sell { -qty } else { qty };

        let body = json!({ "ticker": ticker, "quantity": signed });
        let response = self
            .request(reqwest::Method::POST, "/equity/orders/market", "market_order", Some(&body))
            .await
            .map_err(|e| match e {
                TradingError::BrokerRejected { reason, .. } => TradingError::rejected(symbol, reason),
                other => other,
            })?
            .unwrap_or(Value::Null);

        info!(symbol = %symbol, side = %side, quantity = qty, "Market order placed");
        Ok(OrderResult {
            order_id: response.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            fill_price: response.get("fillPrice").and_then(Value::as_f64),
            status: response
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("SUBMITTED")
                .to_string(),
        })
    }
}

#[async_trait]
impl Broker for Trading212Broker {
    fn name(&self) -> &'static str {
        "trading212"
    }

    async fn get_account(&self) -> TradingResult<AccountInfo> {
        let data = self.get("/equity/account/summary", "account").await?;
        let free_cash = data.pointer("/cash/availableToTrade").and_then(Value::as_f64).unwrap_or(0.0);
        let invested = data.pointer("/investments/totalCost").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(AccountInfo {
            id: match data.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            },
            currency: data.get("currency").and_then(Value::as_str).unwrap_or("EUR").to_string(),
            free_cash,
            invested,
            total_value: data
                .get("totalValue")
                .and_then(Value::as_f64)
                .unwrap_or(free_cash + invested),
        })
    }

    async fn get_positions(&self) -> TradingResult<Vec<BrokerPosition>> {
        let data = self.get("/equity/positions", "positions").await?;
        let items = data.as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let ticker = str_at(item, "ticker");
                Some(BrokerPosition {
                    symbol: symbol_from_ticker(&ticker)?,
                    ticker,
                    quantity: f64_at(item, "quantity"),
                    average_price: f64_at(item, "averagePrice"),
                    current_price: f64_at(item, "currentPrice"),
                    pnl: f64_at(item, "ppl"),
                    pnl_pct: f64_at(item, "pplPercentage") * 100.0,
                })
            })
            .collect())
    }

    async fn buy(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult> {
        self.market_order(symbol, quantity, Direction::Buy).await
    }

    async fn sell(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult> {
        self.market_order(symbol, quantity, Direction::Sell).await
    }

    async fn is_tradeable(&self, symbol: &str) -> TradingResult<bool> {
        Ok(self.ticker_for(symbol).await?.is_some())
    }

    /// Refreshes the cached catalogue.
    async fn instruments(&self) -> TradingResult<Vec<Instrument>> {
        let data = self.get("/equity/metadata/instruments", "instruments").await?;
        let items = data.as_array().cloned().unwrap_or_default();

        let mut map = HashMap::with_capacity(items.len() * 2);
        let mut out = Vec::with_capacity(items.len());
        for item in &items {
            let ticker = str_at(item, "ticker");
            let Some(symbol) = symbol_from_ticker(&ticker) else {
                continue;
            };
            let instrument = Instrument {
                symbol: symbol.clone(),
                ticker: ticker.clone(),
                name: str_at(item, "name"),
                kind: str_at(item, "type"),
                currency: str_at(item, "currencyCode"),
            };
            map.insert(ticker, instrument.clone());
            // First listing of a symbol keeps it
            map.entry(symbol).or_insert_with(|| instrument.clone());
            out.push(instrument);
        }
        info!(count = out.len(), "Loaded broker instruments");
        *self.instruments.write().await = map;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(server: &MockServer) -> Trading212Broker {
        Trading212Broker::new(server.uri(), "key", "secret")
            .with_spacing(EndpointSpacing::new(Duration::from_millis(0)))
            .with_retry_delays(Duration::from_millis(10), Duration::from_millis(10))
    }

    async fn mount_instruments(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/equity/metadata/instruments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ticker": "AAPL_US_EQ", "name": "Apple", "type": "STOCK", "currencyCode": "USD"},
                {"ticker": "MSFT_US_EQ", "name": "Microsoft", "type": "STOCK", "currencyCode": "USD"},
                {"ticker": "9984_JP_EQ", "name": "SoftBank", "type": "STOCK", "currencyCode": "JPY"}
            ])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_basic_auth_and_account() {
        let server = MockServer::start().await;
        // base64("key:secret")
        Mock::given(method("GET"))
            .and(path("/equity/account/summary"))
            .and(header("Authorization", "Basic a2V5OnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "currency": "USD",
                "cash": {"availableToTrade": 1500.5},
                "investments": {"totalCost": 500.0},
                "totalValue": 2010.0
            })))
            .mount(&server)
            .await;

        let account = broker(&server).get_account().await.unwrap();
        assert_eq!(account.id, "42");
        assert_eq!(account.free_cash, 1500.5);
        assert_eq!(account.total_value, 2010.0);
    }

    #[tokio::test]
    async fn test_instruments_skip_invalid_symbols() {
        let server = MockServer::start().await;
        mount_instruments(&server).await;
        let b = broker(&server);
        let instruments = b.instruments().await.unwrap();
        assert_eq!(instruments.len(), 2);
        assert!(b.is_tradeable("aapl").await.unwrap());
        assert!(!b.is_tradeable("GOOG").await.unwrap());
    }

    #[tokio::test]
    async fn test_sell_sends_negative_rounded_quantity() {
        let server = MockServer::start().await;
        mount_instruments(&server).await;
        Mock::given(method("POST"))
            .and(path("/equity/orders/market"))
            .and(body_json(json!({"ticker": "AAPL_US_EQ", "quantity": -1.23})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "status": "NEW"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = broker(&server).sell("AAPL", 1.2345).await.unwrap();
        assert_eq!(result.quantity, 1.23);
        assert_eq!(result.side, Direction::Sell);
        assert_eq!(result.order_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_tiny_quantity_rejected_without_request() {
        let server = MockServer::start().await;
        mount_instruments(&server).await;
        let err = broker(&server).buy("AAPL", 0.004).await.unwrap_err();
        assert!(matches!(err, TradingError::BrokerRejected { .. }));
    }

    #[tokio::test]
    async fn test_server_errors_retried_then_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/equity/positions"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = broker(&server).get_positions().await.unwrap_err();
        assert!(matches!(err, TradingError::Broker(_)));
        assert!(err.is_cycle_fatal());
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/equity/positions"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = broker(&server).get_positions().await.unwrap_err();
        assert!(matches!(err, TradingError::Auth(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/equity/positions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/equity/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ticker": "AAPL_US_EQ", "quantity": 2.0, "averagePrice": 100.0,
                 "currentPrice": 110.0, "ppl": 20.0, "pplPercentage": 0.1}
            ])))
            .mount(&server)
            .await;

        let positions = broker(&server).get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "AAPL");
        assert!((positions[0].pnl_pct - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_position_sells_full_quantity() {
        let server = MockServer::start().await;
        mount_instruments(&server).await;
        Mock::given(method("GET"))
            .and(path("/equity/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ticker": "MSFT_US_EQ", "quantity": 3.5, "averagePrice": 400.0,
                 "currentPrice": 390.0, "ppl": -35.0, "pplPercentage": -0.025}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/equity/orders/market"))
            .and(body_json(json!({"ticker": "MSFT_US_EQ", "quantity": -3.5})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let b = broker(&server);
        let result = b.close_position("MSFT").await.unwrap();
        assert_eq!(result.quantity, 3.5);
        assert!(b.close_position("AAPL").await.is_err());
    }
}
