//! Intraday units: VWAP reversion and opening-range breakout.
//!
//! Both trade today's five-minute bars and are flat by 15:45.

use async_trait::async_trait;
use chrono::{Duration, NaiveTime};
use tracing::warn;

use edge_common::config::StrategyOverride;

use super::invalidation::{ExitRule, InvalidationEngine};
use super::no_trade::{Filter, GateDecision, GateSnapshot, NoTradeGate};
use super::scoring::{band, components, Components, Weights};
use super::{
    restrict, AnalyzeContext, Defaults, ScanContext, ScanOutcome, Signal, StrategyId, StrategySettings, StrategyUnit,
};
use crate::analysis::{AnalysisRecord, Behavior};
use crate::clock::{MarketTime, New_York};
use crate::data::{Bar, MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{bars_on, closes, mean, pct_change, sma, std_dev, volumes, vwap};

fn session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 45, 0).unwrap_or(NaiveTime::MIN)
}

fn bar_time(bar: &Bar) -> NaiveTime {
    bar.ts.with_timezone(&New_York).time()
}

/// Today's five-minute bars, oldest first.
async fn today_bars(data: &dyn MarketData, symbol: &str, now: &MarketTime) -> Vec<Bar> {
    match data.get_history(symbol, Period::Intraday).await {
        Some(bars) => bars_on(&bars, now.date_naive()),
        None => Vec::new(),
    }
}

/// Percent move of SPY from today's open, if there is a session today.
async fn spy_change_from_open(data: &dyn MarketData, now: &MarketTime) -> Option<f64> {
    let bars = today_bars(data, "SPY", now).await;
    let open = bars.first()?.open;
    let last = bars.last()?.close;
    (open > 0.0).then(|| (last - open) / open * 100.0)
}

// ============================================================================
// VWAP Reversion
// ============================================================================

pub const VWAP_UNIVERSE: [&str; 17] = [
    "SPY", "QQQ", "AAPL", "MSFT", "NVDA", "TSLA", "AMD", "AMZN", "META", "GOOGL", "NFLX", "V", "MA", "JPM", "BAC",
    "XLF", "XLK",
];

const VWAP_DEFAULTS: Defaults = Defaults {
    check_time: (10, 0),
    max_hold_days: 1,
    max_positions: 3,
    position_pct: 0.06,
};

/// Price against today's VWAP.
#[derive(Debug, Clone, PartialEq)]
pub struct VwapReading {
    pub vwap: f64,
    pub price: f64,
    pub deviation_pct: f64,
    /// Volume traded so far today
    pub volume: f64,
}

impl VwapReading {
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        let vwap = vwap(bars)?;
        let price = bars.last()?.close;
        Some(Self {
            vwap,
            price,
            deviation_pct: (price - vwap) / vwap * 100.0,
            volume: volumes(bars).iter().sum(),
        })
    }
}

/// Pure scoring of a VWAP deviation. `volume_share` is today's volume so
/// far over the average daily volume.
pub fn vwap_components(
    deviation_pct: f64,
    volume_share: Option<f64>,
    above_sma20: Option<bool>,
    spy_change: Option<f64>,
) -> Components {
    let dev = deviation_pct.abs();
    let deviation = if (1.5..=2.5).contains(&dev) {
        1.0
    } else if dev > 2.5 && dev <= 3.5 {
        0.8
    } else {
        0.5
    };
    let volume_profile = volume_share.map_or(0.7, |s| band(s, &[(0.5, 0.9), (0.25, 0.7)], 0.5));
    let trend = match above_sma20 {
        Some(true) => 0.8,
        Some(false) => 0.4,
        None => 0.5,
    };
    let market_regime = match spy_change {
        Some(c) if c > -0.5 => 0.7,
        Some(_) => 0.4,
        None => 0.5,
    };
    components(&[
        ("deviation", deviation),
        ("volume_profile", volume_profile),
        ("trend", trend),
        ("market_regime", market_regime),
    ])
}

pub struct VwapReversion {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
    min_deviation: f64,
    max_deviation: f64,
}

impl VwapReversion {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("deviation", 0.35),
            ("volume_profile", 0.25),
            ("trend", 0.20),
            ("market_regime", 0.20),
        ]);
        let settings = StrategySettings::resolve(VWAP_DEFAULTS, weights, overrides);
        let exits = InvalidationEngine::new(vec![
            ExitRule::StopLoss { floor_pct: -2.0 },
            ExitRule::TargetPrice { factor: 0.98 },
            ExitRule::SessionClose { at: session_close() },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self {
            min_deviation: settings.param("min_deviation_pct", 1.5),
            max_deviation: settings.param("max_deviation_pct", 4.0),
            settings,
            gate: NoTradeGate::new(vec![Filter::AlreadyHeld]),
            exits,
        }
    }
}

#[async_trait]
impl StrategyUnit for VwapReversion {
    fn id(&self) -> StrategyId {
        StrategyId::VwapReversion
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        restrict(&VWAP_UNIVERSE, weekly_universe)
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        for symbol in self.universe(ctx.weekly_universe) {
            let Some(bars) = ctx.data.get_history(&symbol, Period::OneMonth).await else {
                continue;
            };
            let c = closes(&bars);
            let volatility = std_dev(&pct_change(&c)).map(|sd| sd * 100.0);
            let sma20 = sma(&c, 20);
            let trend = match (c.last(), sma20) {
                (Some(last), Some(avg)) if *last > avg => 0.8,
                (Some(_), Some(_)) => 0.4,
                _ => 0.5,
            };
            let comps = components(&[("trend", trend)]);
            let score = self.score(&comps);
            let mut record = AnalysisRecord::new(self.id().as_str(), &symbol, ctx.week, comps, score, Behavior::Unknown)
                .with_metric("avg_volume", mean(&volumes(&bars)).unwrap_or(0.0));
            if let Some(v) = volatility {
                record = record.with_metric("volatility", v);
            }
            if let Some(s) = sma20 {
                record = record.with_metric("sma20", s);
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        if ctx.records.is_empty() {
            warn!(strategy = %self.id(), week_id = %ctx.week, "No frozen analysis for this week");
            return out;
        }

        let spy_change = spy_change_from_open(ctx.data, &ctx.now).await;
        for symbol in self.universe(ctx.weekly_universe) {
            let bars = today_bars(ctx.data, &symbol, &ctx.now).await;
            let Some(reading) = VwapReading::from_bars(&bars) else {
                continue;
            };
            let dev = reading.deviation_pct;
            if !(dev < -self.min_deviation && dev > -self.max_deviation) {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let record = ctx.record(&symbol);
            let volume_share = record
                .and_then(|r| r.metric("avg_volume"))
                .filter(|v| *v > 0.0)
                .map(|avg| reading.volume / avg);
            let above_sma20 = record.and_then(|r| r.metric("sma20")).map(|s| reading.price > s);
            let comps = vwap_components(dev, volume_share, above_sma20, spy_change);
            let score = self.score(&comps);
            out.emit(
                Signal::buy(
                    &symbol,
                    self.id(),
                    score,
                    format!("{:.1}% below VWAP, expecting reversion", dev.abs()),
                )
                .with_components(comps)
                .with_entry(Some(reading.price))
                .with_target(Some(reading.vwap)),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let snapshot = GateSnapshot::new(symbol).with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }
}

// ============================================================================
// Opening Range Breakout
// ============================================================================

pub const ORB_UNIVERSE: [&str; 13] = [
    "SPY", "QQQ", "AAPL", "MSFT", "NVDA", "TSLA", "AMD", "AMZN", "META", "GOOGL", "NFLX", "CRM", "ADBE",
];

const ORB_DEFAULTS: Defaults = Defaults {
    check_time: (10, 0),
    max_hold_days: 1,
    max_positions: 2,
    position_pct: 0.08,
};

/// The opening range and where price sits against it.
#[derive(Debug, Clone, PartialEq)]
pub struct OpeningRangeReading {
    pub range_high: f64,
    pub range_low: f64,
    pub price: f64,
    /// Mean bar volume after the range over mean bar volume inside it
    pub volume_ratio: f64,
}

impl OpeningRangeReading {
    /// `None` until at least one bar exists on each side of `range_end`.
    pub fn from_bars(bars: &[Bar], range_end: NaiveTime) -> Option<Self> {
        let (inside, after): (Vec<&Bar>, Vec<&Bar>) = bars.iter().partition(|b| bar_time(b) < range_end);
        if inside.is_empty() || after.is_empty() {
            return None;
        }
        let range_high = inside.iter().map(|b| b.high).reduce(f64::max)?;
        let range_low = inside.iter().map(|b| b.low).reduce(f64::min)?;
        let inside_vol = mean(&inside.iter().map(|b| b.volume).collect::<Vec<_>>())?;
        let after_vol = mean(&after.iter().map(|b| b.volume).collect::<Vec<_>>())?;
        Some(Self {
            range_high,
            range_low,
            price: after.last()?.close,
            volume_ratio: if inside_vol > 0.0 { after_vol / inside_vol } else { 1.0 },
        })
    }

    pub fn breaks_up(&self) -> bool {
        self.price > self.range_high
    }

    pub fn breakout_pct(&self) -> f64 {
        if self.range_high > 0.0 {
            (self.price - self.range_high) / self.range_high * 100.0
        } else {
            0.0
        }
    }
}

/// Pure scoring of an opening-range breakout.
pub fn orb_components(reading: &OpeningRangeReading, spy_above_open: Option<bool>) -> Components {
    let v = reading.volume_ratio;
    components(&[
        ("breakout_strength", band(reading.breakout_pct(), &[(1.0, 1.0), (0.5, 0.8)], 0.6)),
        (
            "volume_confirmation",
            if v >= 1.5 {
                0.9
            } else if v >= 1.0 {
                0.7
            } else {
                0.5
            },
        ),
        ("trend_alignment", if spy_above_open == Some(true) { 0.8 } else { 0.4 }),
    ])
}

pub struct OpeningRange {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
    range_minutes: i64,
}

impl OpeningRange {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("breakout_strength", 0.35),
            ("volume_confirmation", 0.30),
            ("trend_alignment", 0.35),
        ]);
        let settings = StrategySettings::resolve(ORB_DEFAULTS, weights, overrides);
        let exits = InvalidationEngine::new(vec![
            ExitRule::BelowStopPrice,
            ExitRule::StopLoss { floor_pct: -1.5 },
            ExitRule::SessionClose { at: session_close() },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        Self {
            range_minutes: settings.param("range_minutes", 30.0) as i64,
            settings,
            gate: NoTradeGate::new(vec![Filter::AlreadyHeld]),
            exits,
        }
    }

    fn range_end(&self) -> NaiveTime {
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN);
        open + Duration::minutes(self.range_minutes)
    }
}

#[async_trait]
impl StrategyUnit for OpeningRange {
    fn id(&self) -> StrategyId {
        StrategyId::OpeningRange
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        restrict(&ORB_UNIVERSE, weekly_universe)
    }

    /// Nothing to precompute: the range only exists intraday.
    async fn analyze(&self, _ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        Ok(Vec::new())
    }

    async fn scan(&self, ctx: &ScanContext<'_>) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        let spy_above_open = spy_change_from_open(ctx.data, &ctx.now).await.map(|c| c > 0.0);
        let range_end = self.range_end();

        for symbol in self.universe(ctx.weekly_universe) {
            let bars = today_bars(ctx.data, &symbol, &ctx.now).await;
            let Some(reading) = OpeningRangeReading::from_bars(&bars, range_end) else {
                continue;
            };
            if !reading.breaks_up() {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let comps = orb_components(&reading, spy_above_open);
            let score = self.score(&comps);
            out.emit(
                Signal::buy(
                    &symbol,
                    self.id(),
                    score,
                    format!(
                        "ORB breakout up, range ${:.2}-${:.2}",
                        reading.range_low, reading.range_high
                    ),
                )
                .with_components(comps)
                .with_entry(Some(reading.price))
                .with_stop(Some(reading.range_low)),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let snapshot = GateSnapshot::new(symbol).with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WeekId;
    use crate::data::memory::intraday_series;
    use crate::data::InMemoryMarketData;
    use crate::execution::Position;
    use crate::strategy::ExitKind;
    use chrono::{NaiveDate, TimeZone};
    use std::collections::{HashMap, HashSet};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    #[test]
    fn test_vwap_components() {
        let c = vwap_components(-2.0, Some(0.6), Some(true), Some(0.1));
        assert_eq!(c["deviation"], 1.0);
        assert_eq!(c["volume_profile"], 0.9);
        assert_eq!(c["trend"], 0.8);
        assert_eq!(c["market_regime"], 0.7);
        assert_eq!(VwapReversion::new(None).score(&c), 5);
        let unknown = vwap_components(-3.8, None, None, None);
        assert_eq!(unknown["deviation"], 0.5);
        assert_eq!(unknown["trend"], 0.5);
    }

    #[test]
    fn test_opening_range_reading() {
        // six bars 09:30-09:55 form the range, then two after 10:00
        let mut prices: Vec<(f64, f64)> = vec![(100.0, 1000.0); 6];
        prices.extend([(100.5, 2000.0), (101.5, 2000.0)]);
        let bars = intraday_series(day(), &prices);
        let end = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let r = OpeningRangeReading::from_bars(&bars, end).unwrap();
        assert_eq!(r.range_high, 100.0);
        assert_eq!(r.price, 101.5);
        assert!(r.breaks_up());
        assert!((r.volume_ratio - 2.0).abs() < 1e-9);

        let c = orb_components(&r, Some(true));
        assert_eq!(c["breakout_strength"], 1.0);
        assert_eq!(c["volume_confirmation"], 0.9);
        assert_eq!(c["trend_alignment"], 0.8);
    }

    #[test]
    fn test_range_needs_bars_after_the_window() {
        let bars = intraday_series(day(), &[(100.0, 1000.0); 4]);
        let end = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        assert!(OpeningRangeReading::from_bars(&bars, end).is_none());
    }

    #[tokio::test]
    async fn test_vwap_scan_signals_below_vwap() {
        let md = InMemoryMarketData::new();
        // heavy volume at 100 pins VWAP near 100; last print at 97.6
        let mut prices = vec![(100.0, 100_000.0); 6];
        prices.push((97.6, 1_000.0));
        md.set_history("AAPL", Period::Intraday, intraday_series(day(), &prices));

        let week = WeekId::for_date(day());
        let mut records = HashMap::new();
        records.insert(
            "AAPL".to_string(),
            AnalysisRecord::new("vwap_reversion", "AAPL", &week, Components::new(), 3, Behavior::Unknown)
                .with_metric("avg_volume", 1_000_000.0)
                .with_metric("sma20", 90.0),
        );
        let universe = vec!["AAPL".to_string()];
        let open = HashSet::new();
        let ctx = ScanContext {
            data: &md,
            week: &week,
            records: &records,
            weekly_universe: &universe,
            open_symbols: &open,
            now: New_York.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap(),
        };
        let out = VwapReversion::new(None).scan(&ctx).await;
        assert_eq!(out.signals.len(), 1);
        let s = &out.signals[0];
        assert!(s.target_price.unwrap() > 99.9);
    }

    #[tokio::test]
    async fn test_session_close_forces_exit() {
        let md = InMemoryMarketData::new();
        md.set_price("AAPL", 100.2);
        let unit = OpeningRange::new(None);
        let entered = "2026-03-10T14:05:00Z".parse().unwrap();
        let mut p = Position::new("AAPL", StrategyId::OpeningRange, 1.0, 100.0, entered, 4, "orb".into());
        p.stop_loss = Some(99.0);

        let before = New_York.with_ymd_and_hms(2026, 3, 10, 15, 44, 0).unwrap();
        let after = New_York.with_ymd_and_hms(2026, 3, 10, 15, 45, 0).unwrap();
        assert!(unit.check_invalidation(&mut p, &md, before).await.is_none());
        let exit = unit.check_invalidation(&mut p, &md, after).await.unwrap();
        assert_eq!(exit.kind, ExitKind::SessionClose);
    }
}
