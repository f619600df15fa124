//! In-memory paper broker.
//!
//! Fills market orders immediately at the current market data price.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{round_quantity, AccountInfo, Broker, BrokerPosition, Instrument, OrderResult};
use crate::data::{clean_symbol, MarketData};
use crate::error::{TradingError, TradingResult};
use crate::strategy::Direction;

#[derive(Debug, Clone, Copy)]
struct Holding {
    quantity: f64,
    average_price: f64,
}

#[derive(Debug)]
struct Ledger {
    cash: f64,
    holdings: HashMap<String, Holding>,
}

pub struct PaperBroker {
    data: Arc<dyn MarketData>,
    ledger: Mutex<Ledger>,
    instruments: Vec<Instrument>,
}

impl PaperBroker {
    pub fn new(data: Arc<dyn MarketData>, cash: f64) -> Self {
        Self {
            data,
            ledger: Mutex::new(Ledger {
                cash,
                holdings: HashMap::new(),
            }),
            instruments: Vec::new(),
        }
    }

    /// Restrict tradeable symbols to a fixed catalogue.
    pub fn with_instruments(mut self, instruments: Vec<Instrument>) -> Self {
        self.instruments = instruments;
        self
    }

    async fn price(&self, symbol: &str) -> TradingResult<f64> {
        self.data
            .get_current_price(symbol)
            .await
            .filter(|p| *p > 0.0)
            .ok_or_else(|| TradingError::rejected(symbol, "no market price"))
    }

    fn order_id() -> Option<String> {
        Some(format!("paper-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_account(&self) -> TradingResult<AccountInfo> {
        let ledger = self.ledger.lock().await;
        let invested: f64 = ledger
            .holdings
            .values()
            .map(|h| h.quantity * h.average_price)
            .sum();
        Ok(AccountInfo {
            id: "paper".into(),
            currency: "USD".into(),
            free_cash: ledger.cash,
            invested,
            total_value: ledger.cash + invested,
        })
    }

    async fn get_positions(&self) -> TradingResult<Vec<BrokerPosition>> {
        let holdings: Vec<(String, Holding)> = {
            let ledger = self.ledger.lock().await;
            ledger.holdings.iter().map(|(s, h)| (s.clone(), *h)).collect()
        };

        let mut out = Vec::with_capacity(holdings.len());
        for (symbol, h) in holdings {
            let current = self
                .data
                .get_current_price(&symbol)
                .await
                .unwrap_or(h.average_price);
            let pnl = (current - h.average_price) * h.quantity;
            out.push(BrokerPosition {
                ticker: format!("{}_US_EQ", symbol),
                symbol,
                quantity: h.quantity,
                average_price: h.average_price,
                current_price: current,
                pnl,
                pnl_pct: (current / h.average_price - 1.0) * 100.0,
            });
        }
        Ok(out)
    }

    async fn buy(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult> {
        let symbol = clean_symbol(symbol).ok_or_else(|| TradingError::rejected(symbol, "invalid symbol"))?;
        if !self.is_tradeable(&symbol).await? {
            return Err(TradingError::rejected(&symbol, "not tradeable"));
        }
        let qty = round_quantity(quantity)
            .ok_or_else(|| TradingError::rejected(&symbol, format!("quantity too small ({:.4})", quantity)))?;
        let price = self.price(&symbol).await?;
        let cost = qty * price;

        let mut ledger = self.ledger.lock().await;
        if cost > ledger.cash + 1e-9 {
            return Err(TradingError::rejected(
                &symbol,
                format!("insufficient funds: need {:.2}, have {:.2}", cost, ledger.cash),
            ));
        }
        ledger.cash -= cost;
        let holding = ledger.holdings.entry(symbol.clone()).or_insert(Holding {
            quantity: 0.0,
            average_price: price,
        });
        let total = holding.quantity + qty;
        holding.average_price = (holding.average_price * holding.quantity + cost) / total;
        holding.quantity = total;

        info!(symbol = %symbol, quantity = qty, price, "Paper buy filled");
        Ok(OrderResult {
            order_id: Self::order_id(),
            symbol,
            side: Direction::Buy,
            quantity: qty,
            fill_price: Some(price),
            status: "FILLED".into(),
        })
    }

    async fn sell(&self, symbol: &str, quantity: f64) -> TradingResult<OrderResult> {
        let symbol = clean_symbol(symbol).ok_or_else(|| TradingError::rejected(symbol, "invalid symbol"))?;
        let qty = round_quantity(quantity)
            .ok_or_else(|| TradingError::rejected(&symbol, format!("quantity too small ({:.4})", quantity)))?;
        let price = self.price(&symbol).await?;

        let mut ledger = self.ledger.lock().await;
        let Some(holding) = ledger.holdings.get_mut(&symbol) else {
            return Err(TradingError::rejected(&symbol, "no open position at broker"));
        };
        // Selling slightly more than held after rounding closes the position
        let sold = qty.min(holding.quantity);
        holding.quantity -= sold;
        if holding.quantity < 1e-9 {
            ledger.holdings.remove(&symbol);
        }
        ledger.cash += sold * price;

        info!(symbol = %symbol, quantity = sold, price, "Paper sell filled");
        Ok(OrderResult {
            order_id: Self::order_id(),
            symbol,
            side: Direction::Sell,
            quantity: sold,
            fill_price: Some(price),
            status: "FILLED".into(),
        })
    }

    async fn is_tradeable(&self, symbol: &str) -> TradingResult<bool> {
        if self.instruments.is_empty() {
            return Ok(true);
        }
        let symbol = clean_symbol(symbol).unwrap_or_default();
        Ok(self.instruments.iter().any(|i| i.symbol == symbol))
    }

    async fn instruments(&self) -> TradingResult<Vec<Instrument>> {
        Ok(self.instruments.clone())
    }
}
