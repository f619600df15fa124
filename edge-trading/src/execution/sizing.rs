//! Position sizing.
//!
//! `notional = free_cash × position_pct × multiplier[score]`, skipped when the
//! result is below the minimum order value.

use serde::Serialize;

use edge_common::config::SizingConfig;

/// Why an order was not sized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SizeSkip {
    /// The score maps to a zero multiplier
    ZeroMultiplier { score: u8 },
    /// Notional below the configured minimum
    BelowMinimum { notional: f64, minimum: f64 },
    /// No usable price to convert notional to quantity
    NoPrice,
}

impl std::fmt::Display for SizeSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroMultiplier { score } => write!(f, "score {} carries no size", score),
            Self::BelowMinimum { notional, minimum } => {
                write!(f, "position too small (${:.2} < ${:.2})", notional, minimum)
            }
            Self::NoPrice => write!(f, "no price available"),
        }
    }
}

/// A sized order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderSize {
    pub notional: f64,
    pub quantity: f64,
    pub price: f64,
}

/// Sizes new entries.
#[derive(Debug, Clone)]
pub struct Sizer {
    multipliers: SizingConfig,
    min_notional: f64,
}

impl Sizer {
    pub fn new(multipliers: SizingConfig, min_notional: f64) -> Self {
        Self {
            multipliers,
            min_notional,
        }
    }

    pub fn notional(&self, free_cash: f64, position_pct: f64, score: u8) -> f64 {
        free_cash.max(0.0) * position_pct * self.multipliers.multiplier(score)
    }

    pub fn size(&self, free_cash: f64, position_pct: f64, score: u8, price: Option<f64>) -> Result<OrderSize, SizeSkip> {
        if self.multipliers.multiplier(score) <= 0.0 {
            return Err(SizeSkip::ZeroMultiplier { score });
        }
        let notional = self.notional(free_cash, position_pct, score);
        if notional < self.min_notional {
            return Err(SizeSkip::BelowMinimum {
                notional,
                minimum: self.min_notional,
            });
        }
        let price = price.filter(|p| p.is_finite() && *p > 0.0).ok_or(SizeSkip::NoPrice)?;
        Ok(OrderSize {
            notional,
            quantity: notional / price,
            price,
        })
    }
}
