//! Exit-rule evaluation for open positions.
//!
//! Rules run in a fixed order: hard stop, trailing stop, strategy target,
//! then time limits. The first rule that fires closes the position; nothing
//! else is considered in that cycle.

use chrono::NaiveTime;
use serde::Serialize;
use std::collections::HashMap;

use edge_common::config::InvalidationConfig;

use crate::clock::MarketTime;
use crate::execution::Position;

/// Tolerance for percentage boundaries.
const EPSILON: f64 = 1e-9;

/// One exit condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitRule {
    /// Close when P&L falls below `floor_pct` (negative)
    StopLoss { floor_pct: f64 },
    /// Close when price trades under the position's own stop level
    BelowStopPrice,
    /// Close when price falls `drop_pct` from the high-water mark
    TrailingStop { drop_pct: f64 },
    /// Close when P&L reaches `pct`
    TakeProfit { pct: f64 },
    /// Close when price reaches `target_price × factor`
    TargetPrice { factor: f64 },
    /// Close when a live metric rises above `limit`
    MetricAbove {
        metric: &'static str,
        limit: f64,
        reason: &'static str,
    },
    /// Close when a live metric falls below `limit`
    MetricBelow {
        metric: &'static str,
        limit: f64,
        reason: &'static str,
    },
    /// Close when a boolean metric is set
    MetricFlag {
        metric: &'static str,
        reason: &'static str,
    },
    /// Intraday: close at or after `at`
    SessionClose { at: NaiveTime },
    /// Close after `days` calendar days
    MaxHold { days: i64 },
}

impl ExitRule {
    /// Position in the canonical evaluation order.
    fn rank(&self) -> u8 {
        match self {
            Self::StopLoss { .. } | Self::BelowStopPrice => 0,
            Self::TrailingStop { .. } => 1,
            Self::TakeProfit { .. }
            | Self::TargetPrice { .. }
            | Self::MetricAbove { .. }
            | Self::MetricBelow { .. }
            | Self::MetricFlag { .. } => 2,
            Self::SessionClose { .. } | Self::MaxHold { .. } => 3,
        }
    }

    pub fn kind(&self) -> ExitKind {
        match self {
            Self::StopLoss { .. } | Self::BelowStopPrice => ExitKind::StopLoss,
            Self::TrailingStop { .. } => ExitKind::TrailingStop,
            Self::TakeProfit { .. }
            | Self::TargetPrice { .. }
            | Self::MetricAbove { .. }
            | Self::MetricBelow { .. }
            | Self::MetricFlag { .. } => ExitKind::Target,
            Self::SessionClose { .. } => ExitKind::SessionClose,
            Self::MaxHold { .. } => ExitKind::MaxHold,
        }
    }

    fn check(&self, p: &Position, price: f64, ctx: &ExitContext) -> Option<String> {
        match self {
            Self::StopLoss { floor_pct } => {
                let pnl = p.pnl_pct(price);
                (pnl < floor_pct - EPSILON).then(|| format!("Max loss hit ({:.1}%)", pnl))
            }
            Self::BelowStopPrice => p
                .stop_loss
                .filter(|stop| price < *stop)
                .map(|stop| format!("Below stop level ${:.2}", stop)),
            Self::TrailingStop { drop_pct } => {
                if p.highest_price() <= p.entry_price {
                    return None;
                }
                let drop = p.drawdown_from_high_pct(price);
                (drop >= drop_pct - EPSILON).then(|| {
                    format!("Trailing stop ({:.1}% from high ${:.2})", drop, p.highest_price())
                })
            }
            Self::TakeProfit { pct } => {
                let pnl = p.pnl_pct(price);
                (pnl >= pct - EPSILON).then(|| format!("Take profit ({:+.1}%)", pnl))
            }
            Self::TargetPrice { factor } => p
                .target_price
                .filter(|target| price >= target * factor)
                .map(|target| format!("Target reached (${:.2})", target)),
            Self::MetricAbove { metric, limit, reason } => ctx
                .metric(metric)
                .filter(|v| *v > *limit)
                .map(|v| format!("{} ({:.1})", reason, v)),
            Self::MetricBelow { metric, limit, reason } => ctx
                .metric(metric)
                .filter(|v| *v < *limit)
                .map(|v| format!("{} ({:.1})", reason, v)),
            Self::MetricFlag { metric, reason } => ctx
                .metric(metric)
                .filter(|v| *v != 0.0)
                .map(|_| (*reason).to_string()),
            Self::SessionClose { at } => {
                (ctx.now.time() >= *at).then(|| "End of session exit".to_string())
            }
            Self::MaxHold { days } => {
                let held = p.days_held(&ctx.now);
                (held >= *days).then(|| format!("Max hold ({} days)", held))
            }
        }
    }
}

/// Which rule family closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    StopLoss,
    TrailingStop,
    Target,
    SessionClose,
    MaxHold,
    /// The owning strategy emitted a SELL
    Signal,
    /// Operator or advisory close, not rule-driven
    Manual,
}

/// Live inputs for one evaluation.
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub now: MarketTime,
    metrics: HashMap<&'static str, f64>,
}

impl ExitContext {
    pub fn new(now: MarketTime) -> Self {
        Self {
            now,
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &'static str, value: Option<f64>) -> Self {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.metrics.insert(name, v);
        }
        self
    }

    pub fn with_flag(self, name: &'static str, value: Option<bool>) -> Self {
        self.with_metric(name, value.map(|b| if b { 1.0 } else { 0.0 }))
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// An exit that should be executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitDecision {
    pub kind: ExitKind,
    pub reason: String,
    pub price: f64,
    pub pnl_pct: f64,
}

/// Ordered exit rules for one strategy.
#[derive(Debug, Clone, Default)]
pub struct InvalidationEngine {
    rules: Vec<ExitRule>,
}

impl InvalidationEngine {
    /// Rules are sorted into canonical order; ties keep the given order.
    pub fn new(mut rules: Vec<ExitRule>) -> Self {
        rules.sort_by_key(ExitRule::rank);
        Self { rules }
    }

    /// Stop, trailing stop and max hold from the global configuration.
    pub fn global(config: &InvalidationConfig) -> Self {
        Self::new(vec![
            ExitRule::StopLoss {
                floor_pct: config.max_loss_pct,
            },
            ExitRule::TrailingStop {
                drop_pct: config.trailing_stop_pct,
            },
            ExitRule::MaxHold {
                days: config.max_hold_days,
            },
        ])
    }

    pub fn rules(&self) -> &[ExitRule] {
        &self.rules
    }

    /// Ratchet the high-water mark, then return the first rule that fires.
    ///
    /// A non-positive or non-finite price leaves the position untouched.
    pub fn evaluate(&self, position: &mut Position, price: f64, ctx: &ExitContext) -> Option<ExitDecision> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        position.ratchet(price);

        self.rules.iter().find_map(|rule| {
            rule.check(position, price, ctx).map(|reason| ExitDecision {
                kind: rule.kind(),
                reason,
                price,
                pnl_pct: position.pnl_pct(price),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::New_York;
    use crate::strategy::StrategyId;
    use chrono::{TimeZone, Utc};

    fn now() -> MarketTime {
        New_York.with_ymd_and_hms(2026, 3, 10, 11, 0, 0).unwrap()
    }

    fn position(entry: f64) -> Position {
        Position::new(
            "AAPL",
            StrategyId::Breakout,
            1.0,
            entry,
            now().with_timezone(&Utc),
            4,
            "test".into(),
        )
    }

    #[test]
    fn test_stop_boundary() {
        let engine = InvalidationEngine::new(vec![ExitRule::StopLoss { floor_pct: -8.0 }]);
        let ctx = ExitContext::new(now());
        assert!(engine.evaluate(&mut position(100.0), 92.0, &ctx).is_none());
        let d = engine.evaluate(&mut position(100.0), 91.0, &ctx).unwrap();
        assert_eq!(d.kind, ExitKind::StopLoss);
        assert!(d.reason.starts_with("Max loss"));
    }

    #[test]
    fn test_trailing_boundary() {
        let engine = InvalidationEngine::new(vec![ExitRule::TrailingStop { drop_pct: 10.0 }]);
        let ctx = ExitContext::new(now());
        let mut p = position(100.0);
        p.ratchet(120.0);
        assert!(engine.evaluate(&mut p, 109.0, &ctx).is_none());
        assert_eq!(engine.evaluate(&mut p, 108.0, &ctx).unwrap().kind, ExitKind::TrailingStop);
    }

    #[test]
    fn test_trailing_needs_profit_first() {
        let engine = InvalidationEngine::new(vec![ExitRule::TrailingStop { drop_pct: 5.0 }]);
        let ctx = ExitContext::new(now());
        assert!(engine.evaluate(&mut position(100.0), 90.0, &ctx).is_none());
    }

    #[test]
    fn test_ratchets_even_without_exit() {
        let engine = InvalidationEngine::new(vec![ExitRule::StopLoss { floor_pct: -8.0 }]);
        let ctx = ExitContext::new(now());
        let mut p = position(100.0);
        for price in [100.0, 105.0, 103.0, 108.0, 95.0] {
            assert!(engine.evaluate(&mut p, price, &ctx).is_none());
        }
        assert_eq!(p.highest_price(), 108.0);
    }

    #[test]
    fn test_first_matching_rule_only() {
        // Listed out of order on purpose; canonical order puts the stop first
        let engine = InvalidationEngine::new(vec![
            ExitRule::MaxHold { days: 0 },
            ExitRule::MetricBelow {
                metric: "sma20_gap",
                limit: 0.0,
                reason: "Closed below 20 SMA",
            },
            ExitRule::StopLoss { floor_pct: -5.0 },
        ]);
        let ctx = ExitContext::new(now()).with_metric("sma20_gap", Some(-3.0));
        let d = engine.evaluate(&mut position(100.0), 90.0, &ctx).unwrap();
        assert_eq!(d.kind, ExitKind::StopLoss);

        let d = engine.evaluate(&mut position(100.0), 99.0, &ctx).unwrap();
        assert_eq!(d.kind, ExitKind::Target);
        assert!(d.reason.starts_with("Closed below 20 SMA"));
    }

    #[test]
    fn test_missing_metric_does_not_close() {
        let engine = InvalidationEngine::new(vec![ExitRule::MetricAbove {
            metric: "rsi2",
            limit: 70.0,
            reason: "RSI target reached",
        }]);
        let ctx = ExitContext::new(now());
        assert!(engine.evaluate(&mut position(100.0), 101.0, &ctx).is_none());
    }

    #[test]
    fn test_target_price_and_stop_level() {
        let engine = InvalidationEngine::new(vec![
            ExitRule::BelowStopPrice,
            ExitRule::TargetPrice { factor: 0.98 },
        ]);
        let ctx = ExitContext::new(now());
        let mut p = position(100.0);
        p.stop_loss = Some(97.0);
        p.target_price = Some(105.0);
        assert!(engine.evaluate(&mut p, 100.0, &ctx).is_none());
        assert_eq!(engine.evaluate(&mut p, 103.0, &ctx).unwrap().kind, ExitKind::Target);
        assert_eq!(engine.evaluate(&mut p, 96.5, &ctx).unwrap().kind, ExitKind::StopLoss);
    }

    #[test]
    fn test_session_close_and_max_hold() {
        let at = NaiveTime::from_hms_opt(15, 45, 0).unwrap();
        let engine = InvalidationEngine::new(vec![ExitRule::SessionClose { at }]);
        let p = &mut position(100.0);
        assert!(engine.evaluate(p, 100.0, &ExitContext::new(now())).is_none());
        let late = New_York.with_ymd_and_hms(2026, 3, 10, 15, 50, 0).unwrap();
        assert_eq!(
            engine.evaluate(p, 100.0, &ExitContext::new(late)).unwrap().kind,
            ExitKind::SessionClose
        );

        let global = InvalidationEngine::global(&InvalidationConfig::default());
        let later = now() + chrono::Duration::days(10);
        let d = global.evaluate(&mut position(100.0), 100.0, &ExitContext::new(later)).unwrap();
        assert_eq!(d.kind, ExitKind::MaxHold);
    }

    #[test]
    fn test_bad_price_ignored() {
        let engine = InvalidationEngine::global(&InvalidationConfig::default());
        let mut p = position(100.0);
        assert!(engine.evaluate(&mut p, f64::NAN, &ExitContext::new(now())).is_none());
        assert!(engine.evaluate(&mut p, 0.0, &ExitContext::new(now())).is_none());
        assert_eq!(p.highest_price(), 100.0);
    }
}
