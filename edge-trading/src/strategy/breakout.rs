//! New 52-week highs on volume.
//!
//! Weekend: measure distance from the 52-week high. Weekday 10:30: buy
//! names within 2% of the high on 1.5x volume with RSI above 50.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitContext, ExitRule, InvalidationEngine};
use super::no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{band, components, Components, Weights};
use super::{
    isolate, restrict, AnalyzeContext, Defaults, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings,
    StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::{MarketTime, WeekId};
use crate::data::{Bar, MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{closes, highest_high, mean, return_pct, rsi_wilder_last, sma, volumes};

const TECH: [&str; 30] = [
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "NVDA", "AVGO", "CRM", "ADBE", "ORCL", "AMD", "QCOM", "AMAT", "LRCX",
    "KLAC", "MRVL", "SNPS", "CDNS", "PANW", "NOW", "CRWD", "ZS", "DDOG", "NET", "SNOW", "MDB", "TEAM", "HUBS",
    "VEEV", "WDAY",
];
const FINANCE: [&str; 10] = ["V", "MA", "JPM", "GS", "MS", "BLK", "SCHW", "CME", "ICE", "SPGI"];
const HEALTHCARE: [&str; 10] = ["UNH", "LLY", "NVO", "ISRG", "DXCM", "IDXX", "EW", "SYK", "BSX", "MDT"];
const CONSUMER: [&str; 10] = ["COST", "HD", "MCD", "SBUX", "NKE", "LULU", "CMG", "DPZ", "ORLY", "AZO"];
const INDUSTRIAL: [&str; 10] = ["CAT", "DE", "GE", "HON", "ETN", "PH", "ROK", "EMR", "ITW", "WM"];
const SECTOR_FUNDS: [&str; 6] = ["XLK", "XLV", "XLF", "XLY", "XLI", "XLE"];

const ALL_SECTORS: [&str; 11] = [
    "XLK", "XLV", "XLF", "XLY", "XLI", "XLE", "XLC", "XLU", "XLB", "XLRE", "XLP",
];

const DEFAULTS: Defaults = Defaults {
    check_time: (10, 30),
    max_hold_days: 30,
    max_positions: 5,
    position_pct: 0.10,
};

/// Sector fund used for relative strength.
pub fn sector_of(symbol: &str) -> &'static str {
    if TECH.contains(&symbol) {
        "XLK"
    } else if FINANCE.contains(&symbol) {
        "XLF"
    } else if HEALTHCARE.contains(&symbol) {
        "XLV"
    } else if CONSUMER.contains(&symbol) {
        "XLY"
    } else if INDUSTRIAL.contains(&symbol) {
        "XLI"
    } else {
        "SPY"
    }
}

fn breakout_universe() -> Vec<&'static str> {
    TECH.iter()
        .chain(&FINANCE)
        .chain(&HEALTHCARE)
        .chain(&CONSUMER)
        .chain(&INDUSTRIAL)
        .chain(&SECTOR_FUNDS)
        .copied()
        .collect()
}

/// Live breakout check over a year of daily bars.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakoutReading {
    pub price: f64,
    pub high_52w: f64,
    pub pct_from_high: f64,
    /// Today's volume over the prior 19 sessions
    pub volume_ratio: f64,
    pub rsi14: f64,
    pub sma20: f64,
}

impl BreakoutReading {
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        if bars.len() < 200 {
            return None;
        }
        let c = closes(bars);
        let v = volumes(bars);
        let price = *c.last()?;
        let high_52w = highest_high(bars)?;
        let prior = &v[v.len().saturating_sub(20)..v.len() - 1];
        let avg = mean(prior).unwrap_or(0.0);
        Some(Self {
            price,
            high_52w,
            pct_from_high: if high_52w > 0.0 { (high_52w - price) / high_52w * 100.0 } else { 100.0 },
            volume_ratio: if avg > 0.0 { v[v.len() - 1] / avg } else { 1.0 },
            rsi14: rsi_wilder_last(&c, 14).unwrap_or(50.0),
            sma20: sma(&c, 20)?,
        })
    }

    pub fn is_breakout(&self, max_pct_from_high: f64, min_volume_ratio: f64) -> bool {
        self.pct_from_high <= max_pct_from_high
            && self.volume_ratio >= min_volume_ratio
            && self.rsi14 > 50.0
            && self.price > self.sma20
    }
}

/// Pure scoring of a breakout.
pub fn breakout_components(reading: &BreakoutReading, sector_rs: f64) -> Components {
    let p = reading.pct_from_high;
    let proximity = if p <= 1.0 {
        1.0
    } else if p <= 2.0 {
        0.9
    } else if p <= 3.0 {
        0.7
    } else if p <= 5.0 {
        0.5
    } else {
        0.3
    };
    let v = reading.volume_ratio;
    let surge = if v >= 3.0 {
        1.0
    } else if v >= 2.0 {
        0.8
    } else if v >= 1.5 {
        0.6
    } else {
        0.4
    };
    let r = reading.rsi14;
    let momentum = if r >= 70.0 {
        0.9
    } else if r >= 60.0 {
        0.8
    } else if r >= 50.0 {
        0.6
    } else {
        0.3
    };
    components(&[
        ("proximity_to_high", proximity),
        ("volume_surge", surge),
        ("momentum", momentum),
        ("sector_strength", band(sector_rs, &[(3.0, 1.0), (1.0, 0.8), (-1.0, 0.6)], 0.3)),
    ])
}

pub struct Breakout {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
    max_pct_from_high: f64,
    min_volume_ratio: f64,
}

impl Breakout {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("proximity_to_high", 0.30),
            ("volume_surge", 0.25),
            ("momentum", 0.25),
            ("sector_strength", 0.20),
        ]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let gate = NoTradeGate::new(vec![
            Filter::Above {
                metric: "extension_pct",
                limit: 10.0,
                reason: "Already extended above 20 SMA",
            },
            Filter::Flag {
                metric: "low_volume",
                reason: "Low volume breakout",
            },
            Filter::Below {
                metric: "spy_5d_change",
                limit: -3.0,
                reason: "Market weakness",
            },
            Filter::AlreadyHeld,
        ]);
        let exits = InvalidationEngine::new(vec![
            ExitRule::StopLoss { floor_pct: -5.0 },
            ExitRule::TrailingStop {
                drop_pct: settings.param("trailing_stop_pct", 10.0),
            },
            ExitRule::MetricFlag {
                metric: "below_sma20",
                reason: "Closed below 20 SMA",
            },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self {
            max_pct_from_high: settings.param("max_pct_from_high", 2.0),
            min_volume_ratio: settings.param("min_volume_ratio", 1.5),
            settings,
            gate,
            exits,
        }
    }

    async fn analyze_symbol(&self, symbol: &str, week: &WeekId, data: &dyn MarketData) -> TradingResult<Option<AnalysisRecord>> {
        let Some(bars) = data.get_history(symbol, Period::OneYear).await else {
            return Ok(None);
        };
        let Some(reading) = BreakoutReading::from_bars(&bars) else {
            return Ok(None);
        };
        let c = closes(&bars);
        let v = volumes(&bars);
        let sma50 = sma(&c, 50).unwrap_or(reading.price);
        let avg_volume = sma(&v, 20).unwrap_or(0.0);
        let recent_volume = sma(&v, 5).unwrap_or(0.0);
        let volume_ratio = if avg_volume > 0.0 { recent_volume / avg_volume } else { 1.0 };

        let weekly = BreakoutReading {
            volume_ratio,
            ..reading.clone()
        };
        let comps = breakout_components(&weekly, 0.0);
        let score = self.score(&comps);
        Ok(Some(
            AnalysisRecord::new(self.id().as_str(), symbol, week, comps, score, Behavior::Unknown)
                .with_metric("current_price", reading.price)
                .with_metric("high_52w", reading.high_52w)
                .with_metric("pct_from_high", reading.pct_from_high)
                .with_metric("rsi", reading.rsi14)
                .with_metric("sma20", reading.sma20)
                .with_metric("above_sma20", f64::from(u8::from(reading.price > reading.sma20)))
                .with_metric("above_sma50", f64::from(u8::from(reading.price > sma50)))
                .with_metric("avg_volume", avg_volume)
                .with_metric("volume_ratio", volume_ratio)
                .with_metric(
                    "in_uptrend",
                    f64::from(u8::from(reading.price > reading.sma20 && reading.sma20 > sma50)),
                ),
        ))
    }

    /// One-month return of each sector fund minus SPY's.
    async fn sector_strength(&self, data: &dyn MarketData) -> HashMap<&'static str, f64> {
        let month_return = |bars: Option<Vec<Bar>>| {
            bars.and_then(|b| {
                let c = closes(&b);
                return_pct(&c, c.len().checked_sub(1)?)
            })
        };
        let spy = month_return(data.get_history("SPY", Period::OneMonth).await).unwrap_or(0.0);
        let mut out = HashMap::new();
        for sector in ALL_SECTORS {
            let rs = month_return(data.get_history(sector, Period::OneMonth).await)
                .map(|r| r - spy)
                .unwrap_or(0.0);
            out.insert(sector, rs);
        }
        out
    }
}

#[async_trait]
impl StrategyUnit for Breakout {
    fn id(&self) -> StrategyId {
        StrategyId::Breakout
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        restrict(&breakout_universe(), weekly_universe)
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        for symbol in self.universe(ctx.weekly_universe) {
            let result = self.analyze_symbol(&symbol, ctx.week, ctx.data).await;
            if let Some(record) = isolate(self.id(), &symbol, result) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            let pa = a.metric("pct_from_high").unwrap_or(f64::MAX);
            let pb = b.metric("pct_from_high").unwrap_or(f64::MAX);
            pa.total_cmp(&pb)
        });
        for r in records.iter().take(10) {
            info!(
                symbol = %r.symbol,
                pct_from_high = r.metric("pct_from_high").unwrap_or(0.0),
                "Near 52-week high"
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

        let strength = self.sector_strength(ctx.data).await;
        for symbol in self.universe(ctx.weekly_universe) {
            let near_high = ctx
                .record(&symbol)
                .and_then(|r| r.metric("pct_from_high"))
                .is_some_and(|p| p <= 10.0);
            if !near_high {
                continue;
            }
            let Some(reading) = ctx
                .data
                .get_history(&symbol, Period::OneYear)
                .await
                .as_deref()
                .and_then(BreakoutReading::from_bars)
            else {
                continue;
            };
            if !reading.is_breakout(self.max_pct_from_high, self.min_volume_ratio) {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let sector_rs = strength.get(sector_of(&symbol)).copied().unwrap_or(0.0);
            let comps = breakout_components(&reading, sector_rs);
            let score = self.score(&comps);
            out.emit(
                Signal::buy(
                    &symbol,
                    self.id(),
                    score,
                    format!(
                        "Breaking out: {:.1}% from 52W high, {:.1}x volume",
                        reading.pct_from_high, reading.volume_ratio
                    ),
                )
                .with_components(comps)
                .with_entry(Some(reading.price))
                .with_stop(Some(reading.price * 0.90)),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let month = ctx.data.get_history(symbol, Period::OneMonth).await;
        let extension = month.as_deref().and_then(|bars| {
            let c = closes(bars);
            let sma20 = sma(&c, 20)?;
            Some((c.last()? - sma20) / sma20 * 100.0)
        });
        let low_volume = month.as_deref().and_then(|bars| {
            let v = volumes(bars);
            let today = *v.last()?;
            let avg = mean(&v[v.len().saturating_sub(20)..v.len() - 1])?;
            Some(today < avg)
        });
        let spy_change = ctx.data.get_history("SPY", Period::FiveDays).await.and_then(|bars| {
            let c = closes(&bars);
            return_pct(&c, c.len().checked_sub(1)?)
        });

        let snapshot = GateSnapshot::new(symbol)
            .with_metric("extension_pct", extension)
            .with_flag("low_volume", low_volume)
            .with_metric("spy_5d_change", spy_change)
            .with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }

    async fn exit_context(&self, symbol: &str, data: &dyn MarketData, now: MarketTime) -> ExitContext {
        let below = data.get_history(symbol, Period::OneMonth).await.and_then(|bars| {
            let c = closes(&bars);
            Some(*c.last()? < sma(&c, 20)?)
        });
        ExitContext::new(now).with_flag("below_sma20", below)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::New_York;
    use crate::data::memory::daily_series;
    use crate::data::InMemoryMarketData;
    use crate::execution::Position;
    use chrono::{NaiveDate, TimeZone};

    fn reading(pct: f64, vol: f64, rsi: f64) -> BreakoutReading {
        BreakoutReading {
            price: 100.0,
            high_52w: 100.0 / (1.0 - pct / 100.0),
            pct_from_high: pct,
            volume_ratio: vol,
            rsi14: rsi,
            sma20: 95.0,
        }
    }

    #[test]
    fn test_universe_size() {
        assert_eq!(breakout_universe().len(), 76);
        assert_eq!(sector_of("NVDA"), "XLK");
        assert_eq!(sector_of("XLE"), "SPY");
    }

    #[test]
    fn test_breakout_conditions() {
        assert!(reading(1.5, 1.6, 60.0).is_breakout(2.0, 1.5));
        assert!(!reading(2.5, 1.6, 60.0).is_breakout(2.0, 1.5));
        assert!(!reading(1.5, 1.4, 60.0).is_breakout(2.0, 1.5));
        assert!(!reading(1.5, 1.6, 50.0).is_breakout(2.0, 1.5));
    }

    #[test]
    fn test_components() {
        let c = breakout_components(&reading(0.5, 3.0, 72.0), 4.0);
        assert_eq!(c["proximity_to_high"], 1.0);
        assert_eq!(c["volume_surge"], 1.0);
        assert_eq!(c["momentum"], 0.9);
        assert_eq!(c["sector_strength"], 1.0);
        assert_eq!(Breakout::new(None).score(&c), 5);

        let weak = breakout_components(&reading(6.0, 1.0, 40.0), -2.0);
        assert_eq!(Breakout::new(None).score(&weak), 1);
    }

    #[tokio::test]
    async fn test_trailing_stop_after_run_up() {
        let md = InMemoryMarketData::new();
        let last = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        md.set_daily("NVDA", daily_series(last, &closes, 1e6));
        md.set_price("NVDA", 107.0);

        let unit = Breakout::new(None);
        let entered = "2026-03-02T15:00:00Z".parse().unwrap();
        let mut p = Position::new("NVDA", StrategyId::Breakout, 1.0, 100.0, entered, 4, "test".into());
        p.ratchet(120.0);
        let now = New_York.with_ymd_and_hms(2026, 3, 10, 11, 0, 0).unwrap();
        let exit = unit.check_invalidation(&mut p, &md, now).await.unwrap();
        assert_eq!(exit.kind, crate::strategy::ExitKind::TrailingStop);
    }
}
