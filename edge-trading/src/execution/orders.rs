//! Entries and exits against the broker.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use edge_common::config::TradingConfig;

use super::{Position, PositionBook, Sizer};
use crate::broker::Broker;
use crate::clock::MarketTime;
use crate::data::MarketData;
use crate::error::{TradingError, TradingResult};
use crate::notification::{NotificationEvent, Notifier};
use crate::store::{Store, TradeRecord};
use crate::strategy::{Direction, ExitKind, Signal, StrategyId};

/// What happened to a BUY signal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum EntryOutcome {
    Opened { quantity: f64, price: f64 },
    /// Not submitted: a cap, a held symbol or sizing said no
    Skipped { reason: String },
    /// Submitted and refused by the broker
    Rejected { reason: String },
}

impl EntryOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened { .. })
    }
}

/// A confirmed exit.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub kind: ExitKind,
    pub reason: String,
}

/// Submits orders and records their effect.
pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    data: Arc<dyn MarketData>,
    store: Store,
    notifier: Notifier,
    sizer: Sizer,
    max_positions: usize,
    min_notional: f64,
}

impl OrderExecutor {
    pub fn new(
        config: &TradingConfig,
        broker: Arc<dyn Broker>,
        data: Arc<dyn MarketData>,
        store: Store,
        notifier: Notifier,
    ) -> Self {
        Self {
            broker,
            data,
            store,
            notifier,
            sizer: Sizer::new(config.sizing.clone(), config.risk.min_notional),
            max_positions: config.risk.max_positions,
            min_notional: config.risk.min_notional,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Execute a BUY signal.
    ///
    /// Caps are checked here, against the live book, so signals produced
    /// earlier in the same cycle cannot overshoot them. Broker refusals are
    /// returned as `Rejected`; transport and auth failures propagate.
    pub async fn open(
        &self,
        book: &mut PositionBook,
        signal: &Signal,
        position_pct: f64,
        unit_cap: usize,
        now: MarketTime,
    ) -> TradingResult<EntryOutcome> {
        if signal.direction != Direction::Buy {
            return Ok(EntryOutcome::Skipped {
                reason: format!("{} signals do not open positions", signal.direction),
            });
        }
        if let Some(owner) = book.get(&signal.symbol) {
            return Ok(EntryOutcome::Skipped {
                reason: format!("already held by {}", owner.strategy_id),
            });
        }
        if book.count_for(signal.strategy_id) >= unit_cap {
            return Ok(EntryOutcome::Skipped {
                reason: format!("{} at max positions ({})", signal.strategy_id, unit_cap),
            });
        }
        if book.len() >= self.max_positions {
            return Ok(EntryOutcome::Skipped {
                reason: format!("account at max positions ({})", self.max_positions),
            });
        }

        let account = self.broker.get_account().await?;
        let price = match self.data.get_current_price(&signal.symbol).await {
            Some(p) => Some(p),
            None => signal.entry_price,
        };
        let size = match self.sizer.size(account.free_cash, position_pct, signal.score, price) {
            Ok(size) => size,
            Err(skip) => {
                return Ok(EntryOutcome::Skipped {
                    reason: skip.to_string(),
                })
            }
        };

        let order = match self.broker.buy(&signal.symbol, size.quantity).await {
            Ok(order) => order,
            Err(TradingError::BrokerRejected { reason, .. }) => {
                warn!(symbol = %signal.symbol, strategy = %signal.strategy_id, reason = %reason, "Buy rejected");
                self.record_event("REJECTED", &signal.symbol, json!({ "strategy": signal.strategy_id, "reason": reason }));
                self.notifier.notify(NotificationEvent::Error {
                    context: format!("Buy {} rejected", signal.symbol),
                    message: reason.clone(),
                });
                return Ok(EntryOutcome::Rejected { reason });
            }
            Err(e) => return Err(e),
        };

        let fill = order.fill_price.unwrap_or(size.price);
        let mut position = Position::new(
            &signal.symbol,
            signal.strategy_id,
            order.quantity,
            fill,
            now.with_timezone(&Utc),
            signal.score,
            signal.reason.clone(),
        );
        position.stop_loss = signal.stop_loss;
        position.target_price = signal.target_price;
        self.track(book, position, now);

        info!(
            symbol = %signal.symbol,
            strategy = %signal.strategy_id,
            quantity = order.quantity,
            price = fill,
            score = signal.score,
            "Position opened"
        );
        self.notifier.notify(NotificationEvent::PositionOpened {
            symbol: signal.symbol.clone(),
            strategy: signal.strategy_id,
            quantity: order.quantity,
            price: fill,
            score: signal.score,
        });
        Ok(EntryOutcome::Opened {
            quantity: order.quantity,
            price: fill,
        })
    }

    /// Operator buy of a fixed dollar amount, owned by [`StrategyId::Manual`].
    pub async fn open_manual(
        &self,
        book: &mut PositionBook,
        symbol: &str,
        value: f64,
        now: MarketTime,
    ) -> TradingResult<EntryOutcome> {
        if book.contains(symbol) {
            return Ok(EntryOutcome::Skipped {
                reason: "already held".into(),
            });
        }
        if value < self.min_notional {
            return Ok(EntryOutcome::Skipped {
                reason: format!("${:.2} is below the ${:.2} minimum", value, self.min_notional),
            });
        }
        let Some(price) = self.data.get_current_price(symbol).await.filter(|p| *p > 0.0) else {
            return Ok(EntryOutcome::Skipped {
                reason: "no price available".into(),
            });
        };
        let signal = Signal::buy(symbol, StrategyId::Manual, 3, format!("Manual buy ${:.2}", value))
            .with_entry(Some(price));
        let order = match self.broker.buy(symbol, value / price).await {
            Ok(order) => order,
            Err(TradingError::BrokerRejected { reason, .. }) => return Ok(EntryOutcome::Rejected { reason }),
            Err(e) => return Err(e),
        };
        let fill = order.fill_price.unwrap_or(price);
        let position = Position::new(
            symbol,
            StrategyId::Manual,
            order.quantity,
            fill,
            now.with_timezone(&Utc),
            signal.score,
            signal.reason,
        );
        self.track(book, position, now);
        self.notifier.notify(NotificationEvent::PositionOpened {
            symbol: symbol.to_string(),
            strategy: StrategyId::Manual,
            quantity: order.quantity,
            price: fill,
            score: 3,
        });
        Ok(EntryOutcome::Opened {
            quantity: order.quantity,
            price: fill,
        })
    }

    fn track(&self, book: &mut PositionBook, position: Position, now: MarketTime) {
        if let Err(e) = self.store.save_position(&position) {
            warn!(symbol = %position.symbol, error = %e, "Failed to persist position");
        }
        self.record_trade(&TradeRecord {
            ts: now.with_timezone(&Utc),
            symbol: position.symbol.clone(),
            strategy_id: position.strategy_id,
            side: Direction::Buy,
            quantity: position.quantity,
            price: position.entry_price,
            pnl: None,
            reason: position.reason.clone(),
        });
        self.record_event(
            "ENTRY",
            &position.symbol,
            json!({
                "strategy": position.strategy_id,
                "quantity": position.quantity,
                "price": position.entry_price,
                "score": position.score,
            }),
        );
        if let Err(dup) = book.insert(position) {
            warn!(symbol = %dup.symbol, "Symbol already in the book after fill");
        }
    }

    /// Close a tracked position.
    ///
    /// The position sits in `Closing` while the sell is in flight. On
    /// success it leaves the book and the store; on failure it goes back to
    /// `Open` and the error is returned. `Ok(None)` means nothing to close.
    pub async fn close(
        &self,
        book: &mut PositionBook,
        symbol: &str,
        kind: ExitKind,
        reason: &str,
        now: MarketTime,
    ) -> TradingResult<Option<ClosedTrade>> {
        let Some(position) = book.get_mut(symbol) else {
            return Ok(None);
        };
        if !position.begin_close() {
            return Ok(None);
        }

        let exit_price = match self.broker.close_position(symbol).await {
            Ok(order) => match order.fill_price {
                Some(p) => p,
                None => self
                    .data
                    .get_current_price(symbol)
                    .await
                    .unwrap_or(position.entry_price),
            },
            Err(e) => {
                let missing = matches!(e, TradingError::BrokerRejected { .. })
                    && matches!(self.broker.get_position(symbol).await, Ok(None));
                if !missing {
                    position.revert_close();
                    warn!(symbol = %symbol, error = %e, "Close failed, position stays open");
                    return Err(e);
                }
                // The broker holds nothing: stop tracking a position that no longer exists
                warn!(symbol = %symbol, error = %e, "Position missing at broker, dropping");
                position.confirm_close();
                let dropped = book.remove(symbol);
                self.forget(symbol);
                self.record_event("DROPPED", symbol, json!({ "reason": e.to_string() }));
                return Ok(dropped.map(|p| ClosedTrade {
                    symbol: p.symbol,
                    strategy_id: p.strategy_id,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    exit_price: p.entry_price,
                    pnl: 0.0,
                    pnl_pct: 0.0,
                    kind: ExitKind::Manual,
                    reason: "not held at broker".into(),
                }));
            }
        };

        position.confirm_close();
        let pnl = position.pnl(exit_price);
        let pnl_pct = position.pnl_pct(exit_price);
        let closed = ClosedTrade {
            symbol: position.symbol.clone(),
            strategy_id: position.strategy_id,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            pnl_pct,
            kind,
            reason: reason.to_string(),
        };
        book.remove(symbol);
        self.forget(symbol);

        self.record_trade(&TradeRecord {
            ts: now.with_timezone(&Utc),
            symbol: closed.symbol.clone(),
            strategy_id: closed.strategy_id,
            side: Direction::Sell,
            quantity: closed.quantity,
            price: exit_price,
            pnl: Some(pnl),
            reason: reason.to_string(),
        });
        self.record_event(
            "EXIT",
            symbol,
            json!({
                "strategy": closed.strategy_id,
                "kind": kind,
                "price": exit_price,
                "pnl": pnl,
                "pnl_pct": pnl_pct,
                "reason": reason,
            }),
        );
        info!(symbol = %symbol, strategy = %closed.strategy_id, price = exit_price, pnl, reason = %reason, "Position closed");
        self.notifier.notify(NotificationEvent::PositionClosed {
            symbol: closed.symbol.clone(),
            strategy: closed.strategy_id,
            price: exit_price,
            pnl,
            pnl_pct,
            reason: reason.to_string(),
        });
        Ok(Some(closed))
    }

    fn forget(&self, symbol: &str) {
        if let Err(e) = self.store.remove_position(symbol) {
            warn!(symbol = %symbol, error = %e, "Failed to remove persisted position");
        }
    }

    fn record_trade(&self, trade: &TradeRecord) {
        if let Err(e) = self.store.log_trade(trade) {
            warn!(symbol = %trade.symbol, error = %e, "Failed to log trade");
        }
    }

    fn record_event(&self, event: &str, symbol: &str, details: serde_json::Value) {
        if let Err(e) = self.store.log_execution(event, Some(symbol), &details) {
            warn!(event, symbol = %symbol, error = %e, "Failed to log execution event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::clock::New_York;
    use crate::data::InMemoryMarketData;
    use crate::execution::PositionState;
    use chrono::TimeZone;

    struct Fixture {
        data: Arc<InMemoryMarketData>,
        store: Store,
        executor: OrderExecutor,
    }

    fn fixture(cash: f64) -> Fixture {
        let data = Arc::new(InMemoryMarketData::new());
        data.set_price("AAPL", 100.0);
        data.set_price("MSFT", 200.0);
        let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(data.clone(), cash));
        let store = Store::in_memory().unwrap();
        let executor = OrderExecutor::new(
            &TradingConfig::default(),
            broker,
            data.clone(),
            store.clone(),
            Notifier::disabled(),
        );
        Fixture { data, store, executor }
    }

    fn now() -> MarketTime {
        New_York.with_ymd_and_hms(2026, 3, 10, 10, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_open_sizes_and_persists() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let signal = Signal::buy("AAPL", StrategyId::Breakout, 5, "breakout").with_stop(Some(95.0));

        let outcome = f.executor.open(&mut book, &signal, 0.10, 3, now()).await.unwrap();
        match outcome {
            EntryOutcome::Opened { quantity, price } => {
                assert_eq!(price, 100.0);
                assert!((quantity - 10.0).abs() < 1e-9);
            }
            other => panic!("expected open, got {:?}", other),
        }
        let p = book.get("AAPL").unwrap();
        assert_eq!(p.stop_loss, Some(95.0));
        assert_eq!(f.store.load_positions().unwrap().len(), 1);
        assert_eq!(f.store.recent_trades(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unit_cap_checked_at_execution() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let first = Signal::buy("AAPL", StrategyId::Breakout, 5, "a");
        let second = Signal::buy("MSFT", StrategyId::Breakout, 5, "b");

        assert!(f.executor.open(&mut book, &first, 0.10, 1, now()).await.unwrap().is_opened());
        let outcome = f.executor.open(&mut book, &second, 0.10, 1, now()).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Skipped { .. }));
        assert_eq!(book.len(), 1);
    }

    #[tokio::test]
    async fn test_symbol_owned_once() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let a = Signal::buy("AAPL", StrategyId::Breakout, 5, "a");
        let b = Signal::buy("AAPL", StrategyId::MeanReversion, 5, "b");
        f.executor.open(&mut book, &a, 0.10, 3, now()).await.unwrap();
        let outcome = f.executor.open(&mut book, &b, 0.10, 3, now()).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Skipped { .. }));
        assert_eq!(book.get("AAPL").unwrap().strategy_id, StrategyId::Breakout);
    }

    #[tokio::test]
    async fn test_broker_rejection_is_not_an_error() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let signal = Signal::buy("GOOG", StrategyId::Breakout, 5, "no quote").with_entry(Some(150.0));
        // Entry price sizes the order but the paper broker has no quote to fill it
        let outcome = f.executor.open(&mut book, &signal, 0.10, 3, now()).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Rejected { .. }));
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn test_close_records_pnl() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let signal = Signal::buy("AAPL", StrategyId::Breakout, 5, "a");
        f.executor.open(&mut book, &signal, 0.10, 3, now()).await.unwrap();

        f.data.set_price("AAPL", 110.0);
        let closed = f
            .executor
            .close(&mut book, "AAPL", ExitKind::Target, "target hit", now())
            .await
            .unwrap()
            .unwrap();
        assert!((closed.pnl - 100.0).abs() < 1e-6);
        assert!((closed.pnl_pct - 10.0).abs() < 1e-9);
        assert!(book.is_empty());
        assert!(f.store.load_positions().unwrap().is_empty());
        let since = now().with_timezone(&Utc) - chrono::Duration::hours(1);
        assert!((f.store.realized_pnl_since(since).unwrap() - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_close_untracked_is_noop() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        assert!(f
            .executor
            .close(&mut book, "AAPL", ExitKind::Manual, "x", now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_close_drops_position_missing_at_broker() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let position = Position::new("AAPL", StrategyId::Breakout, 1.0, 100.0, Utc::now(), 4, "restored".into());
        book.insert(position).unwrap();

        let closed = f
            .executor
            .close(&mut book, "AAPL", ExitKind::StopLoss, "stop", now())
            .await
            .unwrap();
        assert!(closed.is_some());
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn test_manual_buy() {
        let f = fixture(10_000.0);
        let mut book = PositionBook::new();
        let outcome = f.executor.open_manual(&mut book, "MSFT", 500.0, now()).await.unwrap();
        assert!(outcome.is_opened());
        let p = book.get("MSFT").unwrap();
        assert_eq!(p.strategy_id, StrategyId::Manual);
        assert_eq!(p.state(), PositionState::Open);
        assert!((p.quantity - 2.5).abs() < 1e-9);

        let small = f.executor.open_manual(&mut book, "AAPL", 10.0, now()).await.unwrap();
        assert!(matches!(small, EntryOutcome::Skipped { .. }));
    }
}
