//! Strategy units.
//!
//! Every unit implements the same capability set: a universe, a weekend
//! `analyze`, a weekday `scan`, a pure `score`, a NO-TRADE check and an
//! invalidation check. Units are siblings behind one trait object; the
//! scheduler never needs to know which one it is talking to.
//!
//! `scan` may only read (frozen records, live quotes) and return signals.
//! `check_invalidation` depends on live data and the position alone, never
//! on anything `analyze` computed.

mod breakout;
mod gap_fade;
mod intraday;
pub mod invalidation;
mod mean_reversion;
pub mod no_trade;
mod rsi_divergence;
pub mod scoring;
mod sector_momentum;
mod signal;
mod volume_spike;

pub use breakout::Breakout;
pub use gap_fade::GapFade;
pub use intraday::{OpeningRange, VwapReversion};
pub use invalidation::{ExitContext, ExitDecision, ExitKind, ExitRule, InvalidationEngine};
pub use mean_reversion::MeanReversion;
pub use no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
pub use rsi_divergence::RsiDivergence;
pub use scoring::{Components, Weights};
pub use sector_momentum::SectorMomentum;
pub use signal::{Direction, Signal};
pub use volume_spike::VolumeSpike;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use edge_common::config::{parse_hhmm, StrategyOverride, TradingConfig};

use crate::analysis::AnalysisRecord;
use crate::clock::{MarketTime, WeekId};
use crate::data::MarketData;
use crate::error::TradingResult;
use crate::execution::Position;

// ============================================================================
// Identity
// ============================================================================

/// Owner of a position or analysis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    /// Earnings-driven execution
    Earnings,
    SectorMomentum,
    MeanReversion,
    Breakout,
    GapFade,
    VwapReversion,
    OpeningRange,
    RsiDivergence,
    VolumeSpike,
    /// Opened by an operator command
    Manual,
}

impl StrategyId {
    /// Scan units, in scheduling order.
    pub const UNITS: [StrategyId; 8] = [
        Self::SectorMomentum,
        Self::MeanReversion,
        Self::Breakout,
        Self::GapFade,
        Self::VwapReversion,
        Self::OpeningRange,
        Self::RsiDivergence,
        Self::VolumeSpike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earnings => "earnings",
            Self::SectorMomentum => "sector_momentum",
            Self::MeanReversion => "mean_reversion",
            Self::Breakout => "breakout",
            Self::GapFade => "gap_fade",
            Self::VwapReversion => "vwap_reversion",
            Self::OpeningRange => "opening_range",
            Self::RsiDivergence => "rsi_divergence",
            Self::VolumeSpike => "volume_spike",
            Self::Manual => "manual",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Earnings => "Earnings",
            Self::SectorMomentum => "Sector Momentum",
            Self::MeanReversion => "Mean Reversion",
            Self::Breakout => "Breakout",
            Self::GapFade => "Gap Fade",
            Self::VwapReversion => "VWAP Reversion",
            Self::OpeningRange => "ORB",
            Self::RsiDivergence => "RSI Divergence",
            Self::VolumeSpike => "Volume Spike",
            Self::Manual => "Manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = value.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "earnings" => Some(Self::Earnings),
            "orb" => Some(Self::OpeningRange),
            "manual" => Some(Self::Manual),
            _ => Self::UNITS.into_iter().find(|id| id.as_str() == key),
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Built-in defaults for one unit.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub check_time: (u32, u32),
    pub max_hold_days: i64,
    pub max_positions: usize,
    pub position_pct: f64,
}

/// Effective settings after configuration overrides.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub enabled: bool,
    pub check_time: NaiveTime,
    pub max_hold_days: i64,
    pub max_positions: usize,
    pub position_pct: f64,
    pub weights: Weights,
    params: HashMap<String, f64>,
}

impl StrategySettings {
    pub fn resolve(defaults: Defaults, weights: Weights, overrides: Option<&StrategyOverride>) -> Self {
        let (h, m) = defaults.check_time;
        let default_check = NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        let o = overrides.cloned().unwrap_or_default();

        Self {
            enabled: o.enabled.unwrap_or(true),
            check_time: o.check_time.as_deref().and_then(parse_hhmm).unwrap_or(default_check),
            max_hold_days: o.max_hold_days.unwrap_or(defaults.max_hold_days),
            max_positions: o.max_positions.unwrap_or(defaults.max_positions),
            position_pct: o.position_pct.unwrap_or(defaults.position_pct),
            weights: weights.with_overrides(o.weights.as_ref()),
            params: o.params,
        }
    }

    /// Tunable numeric parameter.
    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.params.get(name).copied().filter(|v| v.is_finite()).unwrap_or(default)
    }
}

// ============================================================================
// Contexts
// ============================================================================

/// Inputs to a weekend analysis run.
pub struct AnalyzeContext<'a> {
    pub data: &'a dyn MarketData,
    pub week: &'a WeekId,
    /// This week's tradeable universe (may be empty when unknown)
    pub weekly_universe: &'a [String],
    pub now: MarketTime,
}

/// Inputs to a weekday scan. Everything here is read-only.
pub struct ScanContext<'a> {
    pub data: &'a dyn MarketData,
    pub week: &'a WeekId,
    /// This unit's frozen records for the week, by symbol
    pub records: &'a HashMap<String, AnalysisRecord>,
    pub weekly_universe: &'a [String],
    /// Symbols with an open position under any strategy
    pub open_symbols: &'a HashSet<String>,
    pub now: MarketTime,
}

impl ScanContext<'_> {
    pub fn record(&self, symbol: &str) -> Option<&AnalysisRecord> {
        self.records.get(symbol)
    }

    pub fn is_held(&self, symbol: &str) -> bool {
        self.open_symbols.contains(symbol)
    }
}

/// A candidate a scan rejected, kept for the decision log.
#[derive(Debug, Clone, Serialize)]
pub struct Skipped {
    pub symbol: String,
    pub reasons: Vec<String>,
}

/// What a scan produced.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub signals: Vec<Signal>,
    pub skipped: Vec<Skipped>,
}

impl ScanOutcome {
    pub fn skip(&mut self, symbol: &str, decision: GateDecision) {
        debug!(symbol = %symbol, reasons = %decision.summary(), "NO-TRADE");
        self.skipped.push(Skipped {
            symbol: symbol.to_string(),
            reasons: decision.reasons,
        });
    }

    /// Keep the signal only if it clears the minimum score.
    pub fn emit(&mut self, signal: Signal) {
        if signal.score >= scoring::MIN_SIGNAL_SCORE {
            self.signals.push(signal);
        } else {
            debug!(symbol = %signal.symbol, score = signal.score, "Score below threshold");
        }
    }
}

// ============================================================================
// Unit Trait
// ============================================================================

#[async_trait]
pub trait StrategyUnit: Send + Sync {
    fn id(&self) -> StrategyId;

    fn settings(&self) -> &StrategySettings;

    /// Symbols this unit trades, restricted to the weekly universe.
    fn universe(&self, weekly_universe: &[String]) -> Vec<String>;

    /// Weekend-only heavy computation. One record per analysed symbol.
    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>>;

    /// Weekday scan. Reads frozen records and live quotes, emits signals.
    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome;

    /// 1-5 score from precomputed components.
    fn score(&self, components: &Components) -> u8 {
        scoring::score(components, &self.settings().weights)
    }

    /// Evaluate this unit's NO-TRADE filters for one symbol.
    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision;

    /// Exit rules for positions this unit owns.
    fn exit_rules(&self) -> &InvalidationEngine;

    /// Live metrics the exit rules need.
    async fn exit_context(&self, _symbol: &str, _data: &dyn MarketData, now: MarketTime) -> ExitContext {
        ExitContext::new(now)
    }

    /// Ratchet and evaluate exits for one position. `None` also covers
    /// "no price available": a position is never closed on missing data.
    async fn check_invalidation(
        &self,
        position: &mut Position,
        data: &dyn MarketData,
        now: MarketTime,
    ) -> Option<ExitDecision> {
        let price = data.get_current_price(&position.symbol).await?;
        let ctx = self.exit_context(&position.symbol, data, now).await;
        self.exit_rules().evaluate(position, price, &ctx)
    }
}

/// Restrict a fixed list to the weekly universe. An empty universe means
/// "unknown" and leaves the list as is.
pub(crate) fn restrict(list: &[&str], weekly_universe: &[String]) -> Vec<String> {
    if weekly_universe.is_empty() {
        return list.iter().map(|s| s.to_string()).collect();
    }
    let allowed: HashSet<&str> = weekly_universe.iter().map(String::as_str).collect();
    list.iter().filter(|s| allowed.contains(*s)).map(|s| s.to_string()).collect()
}

/// Log and drop a per-symbol analysis failure.
pub(crate) fn isolate<T>(id: StrategyId, symbol: &str, result: TradingResult<Option<T>>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(strategy = %id, symbol = %symbol, error = %e, "Analysis failed for symbol");
            None
        }
    }
}

/// Build every enabled unit from configuration.
pub fn build_units(config: &TradingConfig) -> Vec<Arc<dyn StrategyUnit>> {
    let o = |id: StrategyId| config.strategies.get(id.as_str());
    let units: Vec<Arc<dyn StrategyUnit>> = vec![
        Arc::new(SectorMomentum::new(o(StrategyId::SectorMomentum))),
        Arc::new(MeanReversion::new(o(StrategyId::MeanReversion))),
        Arc::new(Breakout::new(o(StrategyId::Breakout))),
        Arc::new(GapFade::new(o(StrategyId::GapFade))),
        Arc::new(VwapReversion::new(o(StrategyId::VwapReversion))),
        Arc::new(OpeningRange::new(o(StrategyId::OpeningRange))),
        Arc::new(RsiDivergence::new(o(StrategyId::RsiDivergence))),
        Arc::new(VolumeSpike::new(o(StrategyId::VolumeSpike))),
    ];
    units.into_iter().filter(|u| u.settings().enabled).collect()
}
