//! Broker gateway.
//!
//! Adapters:
//! - Trading 212 REST API (demo or live account)
//! - In-memory paper broker that fills at the market data price

mod paper;
mod t212;

pub use paper::PaperBroker;
pub use t212::{Trading212Broker, DEMO_URL, LIVE_URL};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use edge_common::config::TradingConfig;

use crate::data::{clean_symbol, MarketData};
use crate::error::{TradingError, TradingResult};
use crate::strategy::Direction;

/// Smallest order quantity the broker accepts.
pub const MIN_QUANTITY: f64 = 0.01;

/// A tradeable instrument from the broker's catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Cleaned ticker prefix, e.g. `AAPL`
    pub symbol: String,
    /// Broker ticker, e.g. `AAPL_US_EQ`
    pub ticker: String,
    pub name: String,
    /// Instrument type as reported (`STOCK`, `ETF`, ...)
    pub kind: String,
    pub currency: String,
}

/// Account balances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub currency: String,
    pub free_cash: f64,
    pub invested: f64,
    pub total_value: f64,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub ticker: String,
    pub quantity: f64,
    pub average_price: f64,
    pub current_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Result of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: Direction,
    /// Always positive; the sign convention stays inside the adapter
    pub quantity: f64,
    pub fill_price: Option<f64>,
    pub status: String,
}

/// Order routing and account queries.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_account(&self) -> TradingResult<AccountInfo>;

    async fn get_positions(&self) -> TradingResult<Vec<BrokerPosition>>;

    async fn get_position(&self, symbol: &str) -> TradingResult<Option<BrokerPosition>> {
        let symbol = clean_symbol(symbol).unwrap_or_else(|| symbol.to_string());
        Ok(self.get_positions().await?.into_iter().find(|p| p.symbol == symbol))
    }

    async fn buy(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult>;

    async fn sell(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult>;

    /// Sell the whole broker-side position.
    async fn close_position(&self, symbol: &str) -> TradingResult<OrderResult> {
        match self.get_position(symbol).await? {
            Some(p) if p.quantity > 0.0 => self.sell(symbol, p.quantity).await,
            _ => Err(TradingError::rejected(symbol, "no open position at broker")),
        }
    }

    async fn is_tradeable(&self, symbol: &str) -> TradingResult<bool>;

    /// Full tradeable catalogue.
    async fn instruments(&self) -> TradingResult<Vec<Instrument>>;
}

/// Round to the broker's lot precision. `None` when nothing tradeable is left.
pub fn round_quantity(quantity: f64) -> Option<f64> {
    if !quantity.is_finite() {
        return None;
    }
    let q = (quantity.abs() * 100.0).round() / 100.0;
    (q >= MIN_QUANTITY).then_some(q)
}

/// Symbol part of a broker ticker (`BRK.B_US_EQ` → `BRK-B`).
pub fn symbol_from_ticker(ticker: &str) -> Option<String> {
    clean_symbol(ticker.split('_').next().unwrap_or_default())
}

/// Pick the gateway for the configured mode.
///
/// With credentials: Trading 212 demo (paper mode) or live. Without them
/// paper mode falls back to the in-memory broker; live mode is an error.
pub fn build_broker(config: &TradingConfig, data: Arc<dyn MarketData>) -> TradingResult<Arc<dyn Broker>> {
    if config.broker.has_credentials() {
        let broker = Trading212Broker::from_config(&config.broker, config.paper_mode)?;
        info!(live = !config.paper_mode, "Using Trading 212 broker");
        return Ok(Arc::new(broker));
    }
    if config.paper_mode {
        warn!("No broker credentials, using in-memory paper broker");
        return Ok(Arc::new(PaperBroker::new(data, config.paper_cash)));
    }
    Err(TradingError::Configuration(
        "live trading requires T212_API_KEY and T212_API_SECRET".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryMarketData;

    #[test]
    fn test_round_quantity() {
        assert_eq!(round_quantity(1.234), Some(1.23));
        assert_eq!(round_quantity(-2.5), Some(2.5));
        assert_eq!(round_quantity(0.004), None);
        assert_eq!(round_quantity(f64::NAN), None);
    }

    #[test]
    fn test_symbol_from_ticker() {
        assert_eq!(symbol_from_ticker("AAPL_US_EQ"), Some("AAPL".into()));
        assert_eq!(symbol_from_ticker("BRK.B_US_EQ"), Some("BRK-B".into()));
        assert_eq!(symbol_from_ticker("7203_JP_EQ"), None);
    }

    #[test]
    fn test_live_without_credentials_is_configuration_error() {
        let config = TradingConfig {
            paper_mode: false,
            ..Default::default()
        };
        let data: Arc<dyn MarketData> = Arc::new(InMemoryMarketData::new());
        let err = build_broker(&config, data.clone()).err().unwrap();
        assert!(matches!(err, TradingError::Configuration(_)));

        let paper = TradingConfig::default();
        assert_eq!(build_broker(&paper, data).unwrap().name(), "paper");
    }
}
