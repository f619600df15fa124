//! Sector rotation.
//!
//! Weekend: rank the eleven SPDR sector ETFs by one-month return and score
//! each. Weekday: buy the top three that also sit above their 20 and 50
//! day averages. Exits when the sector falls out of the live top five.

use async_trait::async_trait;
use tracing::{info, warn};

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitContext, ExitRule, InvalidationEngine};
use super::no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{band, components, Components, Weights};
use super::{
    restrict, AnalyzeContext, Defaults, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings,
    StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::MarketTime;
use crate::data::{Bar, MarketData, Period};
use crate::error::{TradingError, TradingResult};
use crate::indicators::{closes, return_pct, sma, volumes};

pub const SECTOR_ETFS: [(&str, &str); 11] = [
    ("XLK", "Technology"),
    ("XLV", "Healthcare"),
    ("XLF", "Financials"),
    ("XLY", "Consumer Discretionary"),
    ("XLP", "Consumer Staples"),
    ("XLE", "Energy"),
    ("XLU", "Utilities"),
    ("XLB", "Materials"),
    ("XLI", "Industrials"),
    ("XLRE", "Real Estate"),
    ("XLC", "Communications"),
];

pub const BENCHMARK: &str = "SPY";
pub const VIX_PROXY: &str = "VIXY";

const DEFAULTS: Defaults = Defaults {
    check_time: (10, 30),
    max_hold_days: 30,
    max_positions: 3,
    position_pct: 0.15,
};

const MIN_SECTORS: usize = 6;
const TOP_N: f64 = 3.0;
const EXIT_RANK: f64 = 5.0;

/// Trailing figures for one ETF.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorStats {
    pub return_1m: f64,
    pub return_3m: f64,
    pub price: f64,
    pub sma20: f64,
    pub sma50: f64,
    pub volume_trend: f64,
}

impl SectorStats {
    /// Needs at least 50 daily bars.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        if bars.len() < 50 {
            return None;
        }
        let c = closes(bars);
        let v = volumes(bars);
        let avg_vol = sma(&v, 20)?;
        Some(Self {
            return_1m: return_pct(&c, 20).unwrap_or(0.0),
            return_3m: return_pct(&c, c.len() - 1)?,
            price: *c.last()?,
            sma20: sma(&c, 20)?,
            sma50: sma(&c, 50)?,
            volume_trend: if avg_vol > 0.0 { sma(&v, 5)? / avg_vol - 1.0 } else { 0.0 },
        })
    }

    pub fn above_sma20(&self) -> bool {
        self.price > self.sma20
    }

    pub fn above_sma50(&self) -> bool {
        self.price > self.sma50
    }
}

/// 1-based ranks by descending one-month return.
pub fn rank_by_momentum(stats: &[(String, SectorStats)]) -> Vec<(String, usize)> {
    let mut order: Vec<(&String, f64)> = stats.iter().map(|(s, st)| (s, st.return_1m)).collect();
    order.sort_by(|a, b| b.1.total_cmp(&a.1));
    order.into_iter().enumerate().map(|(i, (s, _))| (s.clone(), i + 1)).collect()
}

/// Component scores for one sector. Pure.
pub fn sector_components(stats: &SectorStats, spy_return_1m: f64, rank: usize, total: usize) -> Components {
    let momentum_rank = 1.0 - (rank as f64 - 1.0) / (total.max(2) as f64 - 1.0);
    let sma_trend = match (stats.above_sma20(), stats.above_sma50()) {
        (true, true) => 1.0,
        (false, true) => 0.7,
        (true, false) => 0.5,
        (false, false) => 0.2,
    };
    let rs = stats.return_1m - spy_return_1m;
    components(&[
        ("momentum_rank", momentum_rank),
        ("sma_trend", sma_trend),
        ("relative_strength", band(rs, &[(5.0, 1.0), (2.0, 0.8), (0.0, 0.6), (-2.0, 0.4)], 0.2)),
        (
            "volume_trend",
            band(stats.volume_trend, &[(0.2, 0.9), (0.0, 0.7), (-0.2, 0.5)], 0.3),
        ),
    ])
}

pub struct SectorMomentum {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
}

impl SectorMomentum {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("momentum_rank", 0.30),
            ("sma_trend", 0.25),
            ("relative_strength", 0.25),
            ("volume_trend", 0.20),
        ]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let gate = NoTradeGate::new(vec![
            Filter::Above {
                metric: "vix_proxy",
                limit: 50.0,
                reason: "High VIX environment",
            },
            Filter::Flag {
                metric: "breaking_down",
                reason: "Below 50 SMA and falling",
            },
            Filter::AlreadyHeld,
        ]);
        let exits = InvalidationEngine::new(vec![
            ExitRule::StopLoss { floor_pct: -8.0 },
            ExitRule::MetricAbove {
                metric: "momentum_rank",
                limit: EXIT_RANK,
                reason: "Sector dropped out of top 5",
            },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self { settings, gate, exits }
    }

    async fn live_rank(&self, symbol: &str, data: &dyn MarketData) -> Option<f64> {
        let mut returns = Vec::new();
        for (etf, _) in SECTOR_ETFS {
            let Some(bars) = data.get_history(etf, Period::OneMonth).await else {
                continue;
            };
            let c = closes(&bars);
            if let Some(r) = return_pct(&c, c.len().saturating_sub(1)) {
                returns.push((etf, r));
            }
        }
        returns.sort_by(|a, b| b.1.total_cmp(&a.1));
        returns.iter().position(|(s, _)| *s == symbol).map(|i| (i + 1) as f64)
    }
}

#[async_trait]
impl StrategyUnit for SectorMomentum {
    fn id(&self) -> StrategyId {
        StrategyId::SectorMomentum
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        let etfs: Vec<&str> = SECTOR_ETFS.iter().map(|(s, _)| *s).collect();
        restrict(&etfs, weekly_universe)
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let mut stats = Vec::new();
        for symbol in self.universe(ctx.weekly_universe) {
            match ctx.data.get_history(&symbol, Period::ThreeMonths).await.as_deref().and_then(SectorStats::from_bars) {
                Some(s) => stats.push((symbol, s)),
                None => warn!(symbol = %symbol, "Insufficient sector history"),
            }
        }
        if stats.len() < MIN_SECTORS {
            return Err(TradingError::data_unavailable(
                "sectors",
                format!("only {} of {} sector histories", stats.len(), SECTOR_ETFS.len()),
            ));
        }

        let spy = ctx
            .data
            .get_history(BENCHMARK, Period::ThreeMonths)
            .await
            .as_deref()
            .and_then(SectorStats::from_bars)
            .ok_or_else(|| TradingError::data_unavailable(BENCHMARK, "benchmark history"))?;

        let total = stats.len();
        let ranks = rank_by_momentum(&stats);
        let mut records = Vec::with_capacity(total);
        for (symbol, rank) in ranks {
            let Some((_, s)) = stats.iter().find(|(sym, _)| *sym == symbol) else {
                continue;
            };
            let comps = sector_components(s, spy.return_1m, rank, total);
            let score = self.score(&comps);
            let name = SECTOR_ETFS.iter().find(|(e, _)| *e == symbol).map(|(_, n)| *n).unwrap_or("");
            records.push(
                AnalysisRecord::new(self.id().as_str(), &symbol, ctx.week, comps, score, Behavior::Unknown)
                    .with_metric("momentum_rank", rank as f64)
                    .with_metric("return_1m", s.return_1m)
                    .with_metric("return_3m", s.return_3m)
                    .with_metric("relative_strength", s.return_1m - spy.return_1m)
                    .with_metric("volume_trend", s.volume_trend)
                    .with_metric("above_sma20", f64::from(u8::from(s.above_sma20())))
                    .with_metric("above_sma50", f64::from(u8::from(s.above_sma50())))
                    .with_label("sector", name),
            );
        }

        for r in records.iter().take(3) {
            info!(
                symbol = %r.symbol,
                score = r.final_score,
                return_1m = r.metric("return_1m").unwrap_or(0.0),
                "Top sector"
            );
        }
        Ok(records)
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        if ctx.records.is_empty() {
            warn!(strategy = %self.id(), week_id = %ctx.week, "No frozen analysis for this week");
            return out;
        }

        for symbol in self.universe(ctx.weekly_universe) {
            let Some(record) = ctx.record(&symbol) else {
                continue;
            };
            let rank = record.metric("momentum_rank").unwrap_or(f64::MAX);
            let trending = record.metric("above_sma20") == Some(1.0) && record.metric("above_sma50") == Some(1.0);
            if rank > TOP_N || !trending || record.final_score < 3 {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let reason = format!(
                "Rank #{} sector, {:.1}% 1M return",
                rank as usize,
                record.metric("return_1m").unwrap_or(0.0)
            );
            out.emit(
                Signal::buy(&symbol, self.id(), record.final_score, reason)
                    .with_components(record.components.clone())
                    .with_entry(ctx.data.get_current_price(&symbol).await),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let vix = ctx.data.get_current_price(VIX_PROXY).await;
        let breaking_down = ctx.data.get_history(symbol, Period::ThreeMonths).await.and_then(|bars| {
            let c = closes(&bars);
            let sma50 = sma(&c, 50)?;
            let current = *c.last()?;
            let week_ago = *c.get(c.len().checked_sub(5)?)?;
            Some(current < sma50 && current < week_ago)
        });

        let snapshot = GateSnapshot::new(symbol)
            .with_metric("vix_proxy", vix)
            .with_flag("breaking_down", breaking_down)
            .with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }

    async fn exit_context(&self, symbol: &str, data: &dyn MarketData, now: MarketTime) -> ExitContext {
        ExitContext::new(now).with_metric("momentum_rank", self.live_rank(symbol, data).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stats(ret: f64, above20: bool, above50: bool, vol: f64) -> SectorStats {
        SectorStats {
            return_1m: ret,
            return_3m: ret,
            price: 100.0,
            sma20: if above20 { 90.0 } else { 110.0 },
            sma50: if above50 { 90.0 } else { 110.0 },
            volume_trend: vol,
        }
    }

    #[test]
    fn test_rank_by_momentum() {
        let s = vec![
            ("XLK".to_string(), stats(2.0, true, true, 0.0)),
            ("XLE".to_string(), stats(5.0, true, true, 0.0)),
            ("XLU".to_string(), stats(-1.0, true, true, 0.0)),
        ];
        let ranks = rank_by_momentum(&s);
        assert_eq!(ranks[0], ("XLE".to_string(), 1));
        assert_eq!(ranks[2], ("XLU".to_string(), 3));
    }

    #[test]
    fn test_components_top_sector() {
        let c = sector_components(&stats(8.0, true, true, 0.3), 1.0, 1, 11);
        assert_eq!(c["momentum_rank"], 1.0);
        assert_eq!(c["sma_trend"], 1.0);
        assert_eq!(c["relative_strength"], 1.0);
        assert_eq!(c["volume_trend"], 0.9);
        let unit = SectorMomentum::new(None);
        assert_eq!(unit.score(&c), 5);
    }

    #[test]
    fn test_components_bottom_sector() {
        let c = sector_components(&stats(-6.0, false, false, -0.5), 1.0, 11, 11);
        assert_eq!(c["momentum_rank"], 0.0);
        assert_eq!(SectorMomentum::new(None).score(&c), 1);
    }

    #[test]
    fn test_stats_need_fifty_bars() {
        let bars: Vec<Bar> = (0..49)
            .map(|i| Bar {
                ts: Utc::now(),
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0 + i as f64,
                volume: 1000.0,
            })
            .collect();
        assert!(SectorStats::from_bars(&bars).is_none());
    }
}
