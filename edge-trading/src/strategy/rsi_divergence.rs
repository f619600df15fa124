//! Price / RSI divergence.
//!
//! Bullish: price prints a lower low while RSI(14) prints a higher low.
//! Bearish is the mirror image. Found on the weekend over the last 30
//! sessions, confirmed against the live RSI on weekdays.

use async_trait::async_trait;
use std::fmt;
use tracing::{info, warn};

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitContext, ExitRule, InvalidationEngine};
use super::no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{band, components, Components, Weights};
use super::{
    isolate, AnalyzeContext, Defaults, Direction, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings,
    StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::{MarketTime, WeekId};
use crate::data::{MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{closes, peaks, rsi_wilder, rsi_wilder_last, troughs};

const DEFAULTS: Defaults = Defaults {
    check_time: (10, 0),
    max_hold_days: 10,
    max_positions: 5,
    position_pct: 0.10,
};

const RSI_PERIOD: usize = 14;
const LOOKBACK: usize = 30;
const PIVOT_ORDER: usize = 3;
const MIN_PIVOT_GAP: usize = 5;
const RSI_OVERSOLD: f64 = 35.0;
const RSI_OVERBOUGHT: f64 = 65.0;
const SCAN_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    Bullish,
    Bearish,
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            _ => None,
        }
    }
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two pivots that disagree with the oscillator.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub price1: f64,
    pub price2: f64,
    pub rsi1: f64,
    pub rsi2: f64,
    /// RSI points gained per percent of price move
    pub strength: f64,
}

/// Search the last `lookback` bars for the first qualifying pivot pair.
pub fn find_divergence(prices: &[f64], rsi: &[Option<f64>], kind: DivergenceKind, lookback: usize) -> Option<Divergence> {
    let n = prices.len().min(rsi.len());
    let lookback = lookback.min(n.saturating_sub(1));
    if lookback == 0 {
        return None;
    }
    let recent_prices = &prices[n - lookback..n];
    let recent_rsi = &rsi[n - lookback..n];
    let pivots = match kind {
        DivergenceKind::Bullish => troughs(recent_prices, PIVOT_ORDER),
        DivergenceKind::Bearish => peaks(recent_prices, PIVOT_ORDER),
    };

    pivots.windows(2).find_map(|pair| {
        let (i1, i2) = (pair[0], pair[1]);
        if i2 - i1 < MIN_PIVOT_GAP {
            return None;
        }
        let (p1, p2) = (recent_prices[i1], recent_prices[i2]);
        let (r1, r2) = (recent_rsi[i1]?, recent_rsi[i2]?);
        let qualifies = match kind {
            DivergenceKind::Bullish => p2 < p1 && r2 > r1 && r2 < RSI_OVERSOLD + 15.0,
            DivergenceKind::Bearish => p2 > p1 && r2 < r1 && r2 > RSI_OVERBOUGHT - 15.0,
        };
        if !qualifies || p1 <= 0.0 {
            return None;
        }
        let move_pct = ((p2 - p1).abs() / p1 * 100.0).max(0.1);
        Some(Divergence {
            kind,
            price1: p1,
            price2: p2,
            rsi1: r1,
            rsi2: r2,
            strength: ((r2 - r1).abs() / move_pct).abs(),
        })
    })
}

/// Pure scoring of a divergence.
pub fn divergence_components(div: &Divergence, current_rsi: f64) -> Components {
    let extremity = match div.kind {
        DivergenceKind::Bullish if current_rsi < 30.0 => 1.0,
        DivergenceKind::Bullish if current_rsi < 40.0 => 0.7,
        DivergenceKind::Bearish if current_rsi > 70.0 => 1.0,
        DivergenceKind::Bearish if current_rsi > 60.0 => 0.7,
        _ => 0.4,
    };
    components(&[
        (
            "divergence_strength",
            band(div.strength, &[(5.0, 1.0), (2.0, 0.8), (1.0, 0.6)], 0.4),
        ),
        ("oscillator_extremity", extremity),
    ])
}

pub struct RsiDivergence {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
}

impl RsiDivergence {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[("divergence_strength", 0.6), ("oscillator_extremity", 0.4)]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let exits = InvalidationEngine::new(vec![
            ExitRule::BelowStopPrice,
            ExitRule::TargetPrice { factor: 1.0 },
            ExitRule::MetricBelow {
                metric: "rsi14",
                limit: 20.0,
                reason: "RSI extremely oversold, divergence failing",
            },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self {
            settings,
            gate: NoTradeGate::new(vec![Filter::AnalysisConflict, Filter::AlreadyHeld]),
            exits,
        }
    }

    async fn analyze_symbol(&self, symbol: &str, week: &WeekId, data: &dyn MarketData) -> TradingResult<Option<AnalysisRecord>> {
        let Some(bars) = data.get_history(symbol, Period::ThreeMonths).await.filter(|b| b.len() >= 50) else {
            return Ok(None);
        };
        let c = closes(&bars);
        let rsi = rsi_wilder(&c, RSI_PERIOD);
        let bullish = find_divergence(&c, &rsi, DivergenceKind::Bullish, LOOKBACK);
        let bearish = find_divergence(&c, &rsi, DivergenceKind::Bearish, LOOKBACK);
        let div = match (bullish, bearish) {
            (Some(bu), Some(be)) => {
                if bu.strength > be.strength {
                    bu
                } else {
                    be
                }
            }
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => return Ok(None),
        };

        let (Some(price), Some(current_rsi)) = (c.last().copied(), rsi.iter().flatten().last().copied()) else {
            return Ok(None);
        };
        let comps = divergence_components(&div, current_rsi);
        let score = self.score(&comps);
        let (stop, target) = match div.kind {
            DivergenceKind::Bullish => (price * 0.97, price * 1.06),
            DivergenceKind::Bearish => (price * 1.03, price * 0.94),
        };
        let behavior = match div.kind {
            DivergenceKind::Bullish => Behavior::Continuation,
            DivergenceKind::Bearish => Behavior::Mixed,
        };

        Ok(Some(
            AnalysisRecord::new(self.id().as_str(), symbol, week, comps, score, behavior)
                .with_label("divergence_type", div.kind.as_str())
                .with_metric("current_price", price)
                .with_metric("current_rsi", current_rsi)
                .with_metric("strength", div.strength)
                .with_metric("price1", div.price1)
                .with_metric("price2", div.price2)
                .with_metric("rsi1", div.rsi1)
                .with_metric("rsi2", div.rsi2)
                .with_metric("stop_loss", stop)
                .with_metric("target", target),
        ))
    }
}

#[async_trait]
impl StrategyUnit for RsiDivergence {
    fn id(&self) -> StrategyId {
        StrategyId::RsiDivergence
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    /// The first 500 names of the weekly universe; nothing when it is unknown.
    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        weekly_universe.iter().take(SCAN_LIMIT).cloned().collect()
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let universe = self.universe(ctx.weekly_universe);
        if universe.is_empty() {
            warn!(strategy = %self.id(), "No universe loaded");
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for symbol in &universe {
            let result = self.analyze_symbol(symbol, ctx.week, ctx.data).await;
            if let Some(record) = isolate(self.id(), symbol, result) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            let sa = a.metric("strength").unwrap_or(0.0);
            let sb = b.metric("strength").unwrap_or(0.0);
            sb.total_cmp(&sa)
        });
        info!(
            strategy = %self.id(),
            found = records.len(),
            checked = universe.len(),
            "Divergence scan complete"
        );
        Ok(records)
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        if ctx.records.is_empty() {
            warn!(strategy = %self.id(), week_id = %ctx.week, "No frozen analysis for this week");
            return out;
        }

        let mut records: Vec<&AnalysisRecord> = ctx.records.values().collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        for record in records {
            if record.final_score < 3 {
                continue;
            }
            let Some(kind) = record.label("divergence_type").and_then(DivergenceKind::parse) else {
                continue;
            };
            let symbol = record.symbol.as_str();
            let Some(current_rsi) = current_rsi(ctx.data, symbol).await else {
                continue;
            };
            let direction = match kind {
                DivergenceKind::Bullish if current_rsi < RSI_OVERBOUGHT => Direction::Buy,
                DivergenceKind::Bearish if current_rsi > RSI_OVERSOLD => Direction::Sell,
                _ => continue,
            };

            if direction == Direction::Buy {
                let decision = self.check_no_trade(symbol, ctx).await;
                if decision.skip {
                    out.skip(symbol, decision);
                    continue;
                }
            }

            let reason = format!(
                "{} RSI divergence (RSI: {:.0})",
                if kind == DivergenceKind::Bullish { "Bullish" } else { "Bearish" },
                current_rsi
            );
            out.emit(
                Signal::new(symbol, self.id(), direction, record.final_score, reason)
                    .with_components(record.components.clone())
                    .with_entry(record.metric("current_price"))
                    .with_stop(record.metric("stop_loss"))
                    .with_target(record.metric("target")),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let snapshot = GateSnapshot::new(symbol)
            .with_record(ctx.record(symbol))
            .with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }

    async fn exit_context(&self, symbol: &str, data: &dyn MarketData, now: MarketTime) -> ExitContext {
        ExitContext::new(now).with_metric("rsi14", current_rsi(data, symbol).await)
    }
}

/// Latest RSI(14) over a month of daily closes; needs 20 bars.
async fn current_rsi(data: &dyn MarketData, symbol: &str) -> Option<f64> {
    let bars = data.get_history(symbol, Period::OneMonth).await.filter(|b| b.len() >= 20)?;
    rsi_wilder_last(&closes(&bars), RSI_PERIOD)
}
