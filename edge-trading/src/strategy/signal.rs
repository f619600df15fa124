//! Trading signals emitted by scans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::scoring::Components;
use super::StrategyId;

/// Signal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "BUY" => Self::Buy,
            "SELL" => Self::Sell,
            _ => Self::Hold,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scan result. Consumed exactly once by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub direction: Direction,
    /// 1-5
    pub score: u8,
    pub reason: String,
    pub components: Components,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub target_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// A signal with no price levels. Scores outside 1-5 are clamped.
    pub fn new(
        symbol: impl Into<String>,
        strategy_id: StrategyId,
        direction: Direction,
        score: u8,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            strategy_id,
            direction,
            score: score.clamp(1, 5),
            reason: reason.into(),
            components: Components::new(),
            entry_price: None,
            stop_loss: None,
            target_price: None,
            created_at: Utc::now(),
        }
    }

    pub fn buy(symbol: impl Into<String>, strategy_id: StrategyId, score: u8, reason: impl Into<String>) -> Self {
        Self::new(symbol, strategy_id, Direction::Buy, score, reason)
    }

    pub fn with_components(mut self, components: Components) -> Self {
        self.components = components;
        self
    }

    pub fn with_entry(mut self, price: Option<f64>) -> Self {
        self.entry_price = price.filter(|p| *p > 0.0);
        self
    }

    pub fn with_stop(mut self, price: Option<f64>) -> Self {
        self.stop_loss = price.filter(|p| *p > 0.0);
        self
    }

    pub fn with_target(mut self, price: Option<f64>) -> Self {
        self.target_price = price.filter(|p| *p > 0.0);
        self
    }

    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Hold
    }
}
