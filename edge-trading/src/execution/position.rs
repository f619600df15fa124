//! Open positions and the authoritative position book.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clock::{MarketTime, New_York};
use crate::strategy::StrategyId;

/// Lifecycle of a position.
///
/// `Closing` means a sell has been submitted. It is never persisted: it
/// resolves to `Closed` on confirmation or back to `Open` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionState {
    #[default]
    Open,
    Closing,
    Closed,
}

/// A long position owned by exactly one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Highest observed price since entry; only ever moves up
    highest_price: f64,
    pub score: u8,
    pub reason: String,
    pub stop_loss: Option<f64>,
    pub target_price: Option<f64>,
    #[serde(skip)]
    state: PositionState,
}

impl Position {
    pub fn new(
        symbol: impl Into<String>,
        strategy_id: StrategyId,
        quantity: f64,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        score: u8,
        reason: String,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            strategy_id,
            quantity,
            entry_price,
            entry_time,
            highest_price: entry_price,
            score: score.clamp(1, 5),
            reason,
            stop_loss: None,
            target_price: None,
            state: PositionState::Open,
        }
    }

    pub fn highest_price(&self) -> f64 {
        self.highest_price
    }

    /// Raise the high-water mark. Returns `true` if it moved.
    pub fn ratchet(&mut self, price: f64) -> bool {
        if price.is_finite() && price > self.highest_price {
            self.highest_price = price;
            true
        } else {
            false
        }
    }

    /// Unrealised return in percent at `price`.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity
    }

    /// Percent below the high-water mark. Zero until the position has been in profit.
    pub fn drawdown_from_high_pct(&self, price: f64) -> f64 {
        if self.highest_price <= self.entry_price || self.highest_price <= 0.0 {
            return 0.0;
        }
        (self.highest_price - price) / self.highest_price * 100.0
    }

    /// Whole calendar days held, counted on New York dates.
    pub fn days_held(&self, now: &MarketTime) -> i64 {
        let entry = self.entry_time.with_timezone(&New_York).date_naive();
        (now.date_naive() - entry).num_days()
    }

    pub fn market_value(&self, price: f64) -> f64 {
        price * self.quantity
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    /// OPEN → CLOSING. Returns `false` if the position was not open.
    pub fn begin_close(&mut self) -> bool {
        if self.state == PositionState::Open {
            self.state = PositionState::Closing;
            true
        } else {
            false
        }
    }

    /// CLOSING → CLOSED.
    pub fn confirm_close(&mut self) {
        if self.state == PositionState::Closing {
            self.state = PositionState::Closed;
        }
    }

    /// CLOSING → OPEN after a failed sell.
    pub fn revert_close(&mut self) {
        if self.state == PositionState::Closing {
            self.state = PositionState::Open;
        }
    }
}

/// The single authoritative map of open positions, keyed by symbol.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positions(positions: impl IntoIterator<Item = Position>) -> Self {
        let mut book = Self::new();
        for p in positions {
            // First one wins on duplicate symbols
            let _ = book.insert(p);
        }
        book
    }

    /// Add a position. Fails (returning it) if the symbol is already owned.
    pub fn insert(&mut self, position: Position) -> Result<(), Position> {
        if self.positions.contains_key(&position.symbol) {
            return Err(position);
        }
        self.positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Open positions owned by `strategy`.
    pub fn count_for(&self, strategy: StrategyId) -> usize {
        self.positions
            .values()
            .filter(|p| p.strategy_id == strategy && p.state() != PositionState::Closed)
            .count()
    }

    /// Symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Snapshot sorted by entry time.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.positions.values().cloned().collect();
        out.sort_by_key(|p| p.entry_time);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn position(entry: f64) -> Position {
        Position::new("AAPL", StrategyId::Breakout, 1.0, entry, Utc::now(), 4, "test".into())
    }

    #[test]
    fn test_ratchet_is_monotonic() {
        let mut p = position(100.0);
        for price in [100.0, 105.0, 103.0, 108.0, 95.0] {
            p.ratchet(price);
        }
        assert_eq!(p.highest_price(), 108.0);
        assert!(!p.ratchet(f64::NAN));
        assert_eq!(p.highest_price(), 108.0);
    }

    #[test]
    fn test_pnl_and_drawdown() {
        let mut p = position(100.0);
        assert_eq!(p.drawdown_from_high_pct(90.0), 0.0);
        p.ratchet(120.0);
        assert!((p.pnl_pct(108.0) - 8.0).abs() < 1e-9);
        assert!((p.drawdown_from_high_pct(108.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_days_held_calendar() {
        let entry = New_York.with_ymd_and_hms(2026, 3, 2, 15, 59, 0).unwrap();
        let mut p = position(100.0);
        p.entry_time = entry.with_timezone(&Utc);
        let next_morning = New_York.with_ymd_and_hms(2026, 3, 3, 9, 31, 0).unwrap();
        assert_eq!(p.days_held(&next_morning), 1);
        assert_eq!(p.days_held(&(next_morning + Duration::days(9))), 10);
    }

    #[test]
    fn test_close_state_machine() {
        let mut p = position(100.0);
        assert!(p.begin_close());
        assert!(!p.begin_close());
        p.revert_close();
        assert!(p.is_open());
        assert!(p.begin_close());
        p.confirm_close();
        assert_eq!(p.state(), PositionState::Closed);
        p.revert_close();
        assert_eq!(p.state(), PositionState::Closed);
    }

    #[test]
    fn test_book_one_owner_per_symbol() {
        let mut book = PositionBook::new();
        assert!(book.insert(position(100.0)).is_ok());
        let mut other = position(101.0);
        other.strategy_id = StrategyId::MeanReversion;
        assert!(book.insert(other).is_err());
        assert_eq!(book.count_for(StrategyId::Breakout), 1);
        assert_eq!(book.count_for(StrategyId::MeanReversion), 0);
        assert!(book.remove("AAPL").is_some());
        assert!(book.is_empty());
    }
}
