//! Abnormal volume as a footprint of accumulation or distribution.
//!
//! Weekend: find days in the last week trading more than twice the 20-day
//! average and classify the strongest one. Weekday: buy accumulation.

use async_trait::async_trait;
use std::fmt;
use tracing::{info, warn};

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitContext, ExitRule, InvalidationEngine};
use super::no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{band, components, Components, Weights};
use super::{
    isolate, AnalyzeContext, Defaults, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings, StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::{MarketTime, WeekId};
use crate::data::{Bar, MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{closes, mean, range_pct, sma, volumes};

const DEFAULTS: Defaults = Defaults {
    check_time: (10, 0),
    max_hold_days: 10,
    max_positions: 5,
    position_pct: 0.10,
};

const VOLUME_THRESHOLD: f64 = 2.0;
const MIN_AVG_VOLUME: f64 = 500_000.0;
const MIN_PRICE: f64 = 5.0;
const SPIKE_WINDOW: usize = 5;
const CONSOLIDATION_DAYS: usize = 10;
const TIGHT_RANGE_PCT: f64 = 8.0;
const MIN_RECORD_SCORE: u8 = 2;
const SCAN_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeType {
    Accumulation,
    Distribution,
    Churning,
    Mixed,
}

impl SpikeType {
    pub fn classify(price_change_pct: f64, above_sma20: bool, volume_ratio: f64) -> Self {
        if price_change_pct > 0.5 && above_sma20 {
            Self::Accumulation
        } else if price_change_pct < -0.5 && !above_sma20 {
            Self::Distribution
        } else if price_change_pct.abs() < 0.5 && volume_ratio > 3.0 {
            Self::Churning
        } else {
            Self::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accumulation => "accumulation",
            Self::Distribution => "distribution",
            Self::Churning => "churning",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for SpikeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strongest recent spike and the context around it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeReading {
    pub price: f64,
    pub avg_volume_20d: f64,
    pub spike_volume: f64,
    pub volume_ratio: f64,
    /// Open-to-close change on the spike day
    pub price_change_pct: f64,
    pub spike_days: usize,
    pub sma20: f64,
    pub sma50: f64,
    pub range_pct: f64,
}

impl SpikeReading {
    /// `None` when the name is too cheap, too thin, or had no spike.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        if bars.len() < 30 {
            return None;
        }
        let c = closes(bars);
        let v = volumes(bars);
        let n = bars.len();
        let price = *c.last()?;
        if price < MIN_PRICE {
            return None;
        }
        // 20 sessions before today
        let avg = mean(&v[n - 21..n - 1])?;
        if avg < MIN_AVG_VOLUME {
            return None;
        }

        let spikes: Vec<&Bar> = bars[n - SPIKE_WINDOW..]
            .iter()
            .filter(|b| b.volume > avg * VOLUME_THRESHOLD)
            .collect();
        let best = spikes.iter().copied().max_by(|a, b| a.volume.total_cmp(&b.volume))?;
        let sma20 = sma(&c, 20)?;
        Some(Self {
            price,
            avg_volume_20d: avg,
            spike_volume: best.volume,
            volume_ratio: best.volume / avg,
            price_change_pct: if best.open > 0.0 { (best.close - best.open) / best.open * 100.0 } else { 0.0 },
            spike_days: spikes.len(),
            sma20,
            sma50: sma(&c, 50).unwrap_or(sma20),
            range_pct: range_pct(&c, CONSOLIDATION_DAYS)?,
        })
    }

    pub fn above_sma20(&self) -> bool {
        self.price > self.sma20
    }

    pub fn above_sma50(&self) -> bool {
        self.price > self.sma50
    }

    pub fn is_tight_range(&self) -> bool {
        self.range_pct < TIGHT_RANGE_PCT
    }

    pub fn spike_type(&self) -> SpikeType {
        SpikeType::classify(self.price_change_pct, self.above_sma20(), self.volume_ratio)
    }
}

/// Pure scoring of a spike.
pub fn spike_components(r: &SpikeReading) -> Components {
    let kind = r.spike_type();
    let accumulation = match kind {
        SpikeType::Accumulation if r.price_change_pct > 2.0 => 1.0,
        SpikeType::Accumulation => 0.8,
        SpikeType::Mixed | SpikeType::Churning => 0.4,
        SpikeType::Distribution => 0.1,
    };
    let trend_position = match (r.above_sma20(), r.above_sma50()) {
        (true, true) => 1.0,
        (true, false) => 0.7,
        (false, true) => 0.5,
        (false, false) => 0.2,
    };
    let consolidation = match (r.is_tight_range(), kind) {
        (true, SpikeType::Accumulation) => 1.0,
        (true, _) => 0.6,
        _ => 0.3,
    };
    components(&[
        (
            "spike_magnitude",
            band(r.volume_ratio, &[(5.0, 1.0), (3.0, 0.8), (2.0, 0.6)], 0.4),
        ),
        ("accumulation", accumulation),
        ("trend_position", trend_position),
        ("consolidation", consolidation),
    ])
}

pub struct VolumeSpike {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
}

impl VolumeSpike {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("spike_magnitude", 0.35),
            ("accumulation", 0.25),
            ("trend_position", 0.20),
            ("consolidation", 0.20),
        ]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let exits = InvalidationEngine::new(vec![
            ExitRule::BelowStopPrice,
            ExitRule::TargetPrice { factor: 1.0 },
            ExitRule::MetricFlag {
                metric: "distribution",
                reason: "Distribution detected: high volume selloff",
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
        let Some(reading) = data
            .get_history(symbol, Period::ThreeMonths)
            .await
            .as_deref()
            .and_then(SpikeReading::from_bars)
        else {
            return Ok(None);
        };
        let comps = spike_components(&reading);
        let score = self.score(&comps);
        if score < MIN_RECORD_SCORE {
            return Ok(None);
        }

        let kind = reading.spike_type();
        let (stop, target, behavior) = match kind {
            SpikeType::Accumulation => (
                (reading.price * 0.96).min(reading.sma20 * 0.99),
                reading.price * 1.08,
                Behavior::Continuation,
            ),
            _ => (reading.price * 1.04, reading.price * 0.92, Behavior::Mixed),
        };
        Ok(Some(
            AnalysisRecord::new(self.id().as_str(), symbol, week, comps, score, behavior)
                .with_label("spike_type", kind.as_str())
                .with_metric("current_price", reading.price)
                .with_metric("volume_ratio", reading.volume_ratio)
                .with_metric("spike_price_change", reading.price_change_pct)
                .with_metric("avg_volume_20d", reading.avg_volume_20d)
                .with_metric("spike_volume", reading.spike_volume)
                .with_metric("spike_days_count", reading.spike_days as f64)
                .with_metric("range_pct", reading.range_pct)
                .with_metric("sma20", reading.sma20)
                .with_metric("sma50", reading.sma50)
                .with_metric("stop_loss", stop)
                .with_metric("target", target),
        ))
    }
}

#[async_trait]
impl StrategyUnit for VolumeSpike {
    fn id(&self) -> StrategyId {
        StrategyId::VolumeSpike
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

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
        records.sort_by(|a, b| b.final_score.cmp(&a.final_score));
        info!(
            strategy = %self.id(),
            found = records.len(),
            checked = universe.len(),
            "Volume spike scan complete"
        );
        Ok(records)
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        if ctx.records.is_empty() {
            warn!(strategy = %self.id(), week_id = %ctx.week, "No frozen analysis for this week");
            return out;
        }

        let mut records: Vec<&AnalysisRecord> = ctx
            .records
            .values()
            .filter(|r| r.label("spike_type") == Some(SpikeType::Accumulation.as_str()) && r.final_score >= 3)
            .collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        for record in records {
            let symbol = record.symbol.as_str();
            let decision = self.check_no_trade(symbol, ctx).await;
            if decision.skip {
                out.skip(symbol, decision);
                continue;
            }
            out.emit(
                Signal::buy(
                    symbol,
                    self.id(),
                    record.final_score,
                    format!(
                        "Volume spike accumulation ({:.1}x avg vol)",
                        record.metric("volume_ratio").unwrap_or(0.0)
                    ),
                )
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

    /// High-volume selloff over the last five sessions.
    async fn exit_context(&self, symbol: &str, data: &dyn MarketData, now: MarketTime) -> ExitContext {
        let distribution = data
            .get_history(symbol, Period::FiveDays)
            .await
            .filter(|b| b.len() >= 3)
            .and_then(|bars| {
                let v = volumes(&bars);
                let c = closes(&bars);
                let n = c.len();
                let avg = mean(&v)?;
                let change = (c[n - 1] / c[n - 2] - 1.0) * 100.0;
                Some(v[n - 1] > avg * 2.0 && change < -2.0)
            });
        ExitContext::new(now).with_flag("distribution", distribution)
    }
}
