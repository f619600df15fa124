//! Overnight gap fade.
//!
//! Weekend: measure how often each symbol's 3%+ gaps filled over the last
//! quarter. Weekday 09:35: buy gap-downs of 3-10% expecting a partial fill,
//! flat by the end of the session.

use async_trait::async_trait;
use chrono::NaiveTime;
use tracing::{debug, warn};

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitRule, InvalidationEngine};
use super::no_trade::{metric, Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{components, Components, Weights};
use super::{
    isolate, restrict, AnalyzeContext, Defaults, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings,
    StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::{MarketTime, WeekId};
use crate::data::{Bar, MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{gap_pct, mean, volumes};

pub const GAP_FADE_UNIVERSE: [&str; 52] = [
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "NVDA", "AVGO", "CRM", "ADBE", "ORCL", "JPM", "BAC", "GS", "MS", "V",
    "MA", "BLK", "SCHW", "JNJ", "UNH", "PFE", "MRK", "ABBV", "LLY", "TMO", "DHR", "PG", "KO", "PEP", "WMT", "COST",
    "HD", "MCD", "NKE", "CAT", "DE", "HON", "GE", "UPS", "FDX", "LMT", "RTX", "SPY", "QQQ", "IWM", "XLK", "XLF",
    "XLV", "XLE", "XLY", "AMD", "NFLX",
];

const DEFAULTS: Defaults = Defaults {
    check_time: (9, 35),
    max_hold_days: 1,
    max_positions: 3,
    position_pct: 0.08,
};

const MIN_GAP_PCT: f64 = 3.0;
const MAX_GAP_PCT: f64 = 10.0;
const STOP_LOSS_PCT: f64 = 3.0;
const MIN_AVG_VOLUME: f64 = 500_000.0;

/// Historical gap behaviour over a window of daily bars.
#[derive(Debug, Clone, PartialEq)]
pub struct GapHistory {
    pub total_gaps: usize,
    /// Share of gaps that traded back through the prior close the same day
    pub fill_rate: f64,
    pub avg_gap_size: f64,
}

impl GapHistory {
    /// `None` when no gap of at least `min_gap` occurred.
    pub fn from_bars(bars: &[Bar], min_gap: f64) -> Option<Self> {
        let mut sizes = Vec::new();
        let mut filled = 0usize;
        for w in bars.windows(2) {
            let (prev, today) = (&w[0], &w[1]);
            let Some(gap) = gap_pct(prev.close, today.open) else {
                continue;
            };
            if gap.abs() < min_gap {
                continue;
            }
            sizes.push(gap.abs());
            let fill = if gap > 0.0 { today.low <= prev.close } else { today.high >= prev.close };
            if fill {
                filled += 1;
            }
        }
        if sizes.is_empty() {
            return None;
        }
        Some(Self {
            total_gaps: sizes.len(),
            fill_rate: filled as f64 / sizes.len() as f64,
            avg_gap_size: mean(&sizes)?,
        })
    }
}

/// Today's opening gap.
#[derive(Debug, Clone, PartialEq)]
pub struct GapReading {
    pub prev_close: f64,
    pub open: f64,
    pub current: f64,
    pub gap_pct: f64,
    pub volume: f64,
}

impl GapReading {
    /// Requires the last bar to be today's session; a stale bar is not a gap.
    pub fn from_bars(bars: &[Bar], now: &MarketTime) -> Option<Self> {
        let n = bars.len();
        if n < 2 {
            return None;
        }
        let (prev, today) = (&bars[n - 2], &bars[n - 1]);
        if today.date() != now.date_naive() {
            return None;
        }
        Some(Self {
            prev_close: prev.close,
            open: today.open,
            current: today.close,
            gap_pct: gap_pct(prev.close, today.open)?,
            volume: today.volume,
        })
    }

    /// Price at which `fill_fraction` of the gap has been retraced.
    pub fn fill_target(&self, fill_fraction: f64) -> f64 {
        self.open + fill_fraction * (self.prev_close - self.open)
    }
}

/// Pure scoring of a gap.
pub fn gap_components(gap_pct: f64, fill_rate: Option<f64>, volume_ratio: f64, spy_gap: Option<f64>) -> Components {
    let size = gap_pct.abs();
    let gap_size = if (3.0..=5.0).contains(&size) {
        1.0
    } else if size > 5.0 && size <= 7.0 {
        0.8
    } else if size > 7.0 && size <= 10.0 {
        0.5
    } else {
        0.3
    };
    let volume = if volume_ratio >= 2.0 {
        1.0
    } else if volume_ratio >= 1.5 {
        0.8
    } else if volume_ratio >= 1.0 {
        0.6
    } else {
        0.4
    };
    let market_direction = match spy_gap {
        Some(spy) if (spy > 0.0 && gap_pct < 0.0) || (spy < 0.0 && gap_pct > 0.0) => 0.5,
        Some(_) => 0.8,
        None => 0.6,
    };
    components(&[
        ("gap_size", gap_size),
        ("fill_rate", fill_rate.unwrap_or(0.5)),
        ("volume", volume),
        ("market_direction", market_direction),
    ])
}

pub struct GapFade {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
    fill_fraction: f64,
}

impl GapFade {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("gap_size", 0.30),
            ("fill_rate", 0.25),
            ("volume", 0.25),
            ("market_direction", 0.20),
        ]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let gate = NoTradeGate::new(vec![Filter::MinAvgVolume(MIN_AVG_VOLUME), Filter::AlreadyHeld]);
        let exits = InvalidationEngine::new(vec![
            ExitRule::StopLoss {
                floor_pct: -STOP_LOSS_PCT,
            },
            ExitRule::TargetPrice { factor: 1.0 },
            ExitRule::SessionClose {
                at: NaiveTime::from_hms_opt(15, 45, 0).unwrap_or(NaiveTime::MIN),
            },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self {
            fill_fraction: settings.param("fill_fraction", 0.5).clamp(0.0, 1.0),
            settings,
            gate,
            exits,
        }
    }

    async fn analyze_symbol(&self, symbol: &str, week: &WeekId, data: &dyn MarketData) -> TradingResult<Option<AnalysisRecord>> {
        let Some(bars) = data.get_history(symbol, Period::ThreeMonths).await.filter(|b| b.len() >= 50) else {
            return Ok(None);
        };
        let Some(history) = GapHistory::from_bars(&bars, MIN_GAP_PCT) else {
            debug!(symbol = %symbol, "No qualifying gaps in window");
            return Ok(None);
        };
        let comps = components(&[("fill_rate", history.fill_rate)]);
        let score = self.score(&comps);
        let behavior = if history.fill_rate >= 0.6 {
            Behavior::Fade
        } else if history.fill_rate <= 0.4 {
            Behavior::Continuation
        } else {
            Behavior::Mixed
        };
        Ok(Some(
            AnalysisRecord::new(self.id().as_str(), symbol, week, comps, score, behavior)
                .with_metric("total_gaps", history.total_gaps as f64)
                .with_metric("fill_rate", history.fill_rate)
                .with_metric("avg_gap_size", history.avg_gap_size)
                .with_metric("avg_volume", mean(&volumes(&bars)).unwrap_or(0.0)),
        ))
    }
}

#[async_trait]
impl StrategyUnit for GapFade {
    fn id(&self) -> StrategyId {
        StrategyId::GapFade
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        restrict(&GAP_FADE_UNIVERSE, weekly_universe)
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        for symbol in self.universe(ctx.weekly_universe) {
            let result = self.analyze_symbol(&symbol, ctx.week, ctx.data).await;
            if let Some(record) = isolate(self.id(), &symbol, result) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        if ctx.records.is_empty() {
            warn!(strategy = %self.id(), week_id = %ctx.week, "No frozen analysis for this week");
            return out;
        }

        let spy_gap = ctx
            .data
            .get_history("SPY", Period::FiveDays)
            .await
            .and_then(|bars| GapReading::from_bars(&bars, &ctx.now))
            .map(|g| g.gap_pct);

        for symbol in self.universe(ctx.weekly_universe) {
            let Some(gap) = ctx
                .data
                .get_history(&symbol, Period::FiveDays)
                .await
                .and_then(|bars| GapReading::from_bars(&bars, &ctx.now))
            else {
                continue;
            };
            let size = gap.gap_pct.abs();
            if !(MIN_GAP_PCT..=MAX_GAP_PCT).contains(&size) {
                continue;
            }
            // Long only: gap-ups are not faded
            if gap.gap_pct >= 0.0 {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let record = ctx.record(&symbol);
            let avg_volume = record.and_then(|r| r.metric("avg_volume")).unwrap_or(gap.volume);
            let volume_ratio = if avg_volume > 0.0 { gap.volume / avg_volume } else { 1.0 };
            let comps = gap_components(
                gap.gap_pct,
                record.and_then(|r| r.metric("fill_rate")),
                volume_ratio,
                spy_gap,
            );
            let score = self.score(&comps);
            let entry = ctx.data.get_current_price(&symbol).await.unwrap_or(gap.current);
            out.emit(
                Signal::buy(
                    &symbol,
                    self.id(),
                    score,
                    format!("Gap down {:.1}%, expecting bounce", gap.gap_pct),
                )
                .with_components(comps)
                .with_entry(Some(entry))
                .with_stop(Some(entry * (1.0 - STOP_LOSS_PCT / 100.0)))
                .with_target(Some(gap.fill_target(self.fill_fraction))),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let avg_volume = match ctx.data.get_history(symbol, Period::OneMonth).await {
            Some(bars) => mean(&volumes(&bars)),
            None => None,
        };
        let snapshot = GateSnapshot::new(symbol)
            .with_metric(metric::AVG_VOLUME, avg_volume)
            .with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }
}
