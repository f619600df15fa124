//! Oversold bounce on quality large caps.
//!
//! Weekend: keep names worth at least $10B and note whether each sits above
//! its 200-day average. Weekday 09:45: buy when RSI(2) is deeply oversold.

use async_trait::async_trait;
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
use crate::data::{MarketData, Period};
use crate::error::TradingResult;
use crate::indicators::{annualized_volatility, closes, mean, rsi_simple, sma, volumes};

pub const QUALITY_UNIVERSE: [&str; 120] = [
    // Tech
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "NVDA", "AVGO", "CSCO", "ORCL", "CRM", "ADBE", "ACN", "IBM", "INTC",
    "AMD", "QCOM", "TXN", "AMAT", "MU", "LRCX",
    // Finance
    "JPM", "BAC", "WFC", "GS", "MS", "BLK", "SCHW", "C", "USB", "PNC", "AXP", "COF", "BK", "TFC", "CME", "ICE",
    "MMC", "AON", "SPGI", "MCO",
    // Healthcare
    "JNJ", "UNH", "PFE", "MRK", "ABBV", "TMO", "DHR", "BMY", "LLY", "AMGN", "GILD", "MDT", "SYK", "BSX", "ISRG",
    "EW", "ZBH", "BDX", "ABT", "CVS",
    // Consumer
    "PG", "KO", "PEP", "WMT", "COST", "HD", "MCD", "NKE", "SBUX", "TGT", "LOW", "TJX", "DG", "DLTR", "ROST", "YUM",
    "CMG", "DPZ", "ORLY", "AZO",
    // Industrial
    "CAT", "DE", "HON", "MMM", "GE", "UPS", "FDX", "LMT", "RTX", "BA", "NOC", "GD", "EMR", "ETN", "ITW", "PH",
    "ROK", "CMI", "PCAR", "WM",
    // Energy
    "XOM", "CVX", "COP", "SLB", "EOG", "OXY", "MPC", "VLO", "PSX", "HES",
    // Other
    "DIS", "NFLX", "CMCSA", "T", "VZ", "NEE", "DUK", "SO", "D", "AEP",
];

const DEFAULTS: Defaults = Defaults {
    check_time: (9, 45),
    max_hold_days: 5,
    max_positions: 5,
    position_pct: 0.08,
};

const MIN_MARKET_CAP: f64 = 10_000_000_000.0;

/// Live oversold reading for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OversoldReading {
    pub rsi2: f64,
    pub price: f64,
    /// Percent below the 20-day high (negative)
    pub drawdown_pct: f64,
    /// Today's volume over the 20-day mean
    pub volume_spike: f64,
}

impl OversoldReading {
    /// Needs at least 14 daily closes.
    pub fn from_series(closes: &[f64], volumes: &[f64]) -> Option<Self> {
        if closes.len() < 14 {
            return None;
        }
        let price = *closes.last()?;
        let window = &closes[closes.len().saturating_sub(20)..];
        let high_20 = window.iter().copied().reduce(f64::max)?;
        let avg_vol = mean(&volumes[volumes.len().saturating_sub(20)..]).unwrap_or(0.0);
        Some(Self {
            rsi2: rsi_simple(closes, 2)?,
            price,
            drawdown_pct: if high_20 > 0.0 { (price - high_20) / high_20 * 100.0 } else { 0.0 },
            volume_spike: match volumes.last() {
                Some(v) if avg_vol > 0.0 => v / avg_vol,
                _ => 1.0,
            },
        })
    }
}

/// Pure scoring inputs to components.
pub fn reversion_components(reading: &OversoldReading, sma200: Option<f64>) -> Components {
    let rsi = reading.rsi2;
    let rsi_extremity = if rsi < 5.0 {
        1.0
    } else if rsi < 10.0 {
        0.8
    } else if rsi < 15.0 {
        0.6
    } else if rsi < 20.0 {
        0.4
    } else {
        0.2
    };
    components(&[
        ("rsi_extremity", rsi_extremity),
        ("trend_strength", trend_strength(reading.price, sma200)),
        (
            "drawdown_depth",
            band(reading.drawdown_pct.abs(), &[(15.0, 1.0), (10.0, 0.8), (5.0, 0.6)], 0.4),
        ),
        (
            "volume_spike",
            band(reading.volume_spike, &[(3.0, 1.0), (2.0, 0.8), (1.5, 0.6)], 0.4),
        ),
    ])
}

fn trend_strength(price: f64, sma200: Option<f64>) -> f64 {
    match sma200 {
        Some(s) if s > 0.0 => band(
            (price - s) / s * 100.0,
            &[(20.0, 1.0), (10.0, 0.8), (0.0, 0.6), (-5.0, 0.4)],
            0.2,
        ),
        _ => 0.5,
    }
}

/// Blend of size and analyst coverage in `[0, 1]`.
pub fn quality_score(market_cap: f64, analysts: u32) -> f64 {
    (market_cap / 100_000_000_000.0).min(1.0) * 0.5 + (f64::from(analysts) / 20.0).min(1.0) * 0.5
}

pub struct MeanReversion {
    settings: StrategySettings,
    gate: NoTradeGate,
    exits: InvalidationEngine,
    rsi_entry: f64,
}

impl MeanReversion {
    pub fn new(overrides: Option<&StrategyOverride>) -> Self {
        let weights = Weights::new(&[
            ("rsi_extremity", 0.30),
            ("trend_strength", 0.25),
            ("drawdown_depth", 0.25),
            ("volume_spike", 0.20),
        ]);
        let settings = StrategySettings::resolve(DEFAULTS, weights, overrides);
        let gate = NoTradeGate::new(vec![
            Filter::Above {
                metric: "spy_volatility",
                limit: 35.0,
                reason: "High volatility",
            },
            Filter::Flag {
                metric: "below_sma200",
                reason: "Below 200 SMA",
            },
            Filter::Below {
                metric: "day_change_pct",
                limit: -8.0,
                reason: "Gap down too large",
            },
            Filter::AlreadyHeld,
        ]);
        let exits = InvalidationEngine::new(vec![
            ExitRule::StopLoss { floor_pct: -5.0 },
            ExitRule::MetricAbove {
                metric: "rsi2",
                limit: settings.param("rsi_exit", 70.0),
                reason: "RSI target reached",
            },
            ExitRule::TakeProfit { pct: 5.0 },
            ExitRule::MaxHold {
                days: settings.max_hold_days,
            },
        ]);
        let rsi_entry = settings.param("rsi_entry", 10.0);
        Self {
            settings,
            gate,
            exits,
            rsi_entry,
        }
    }

    async fn analyze_symbol(&self, symbol: &str, week: &WeekId, data: &dyn MarketData) -> TradingResult<Option<AnalysisRecord>> {
        let Some(bars) = data.get_history(symbol, Period::OneYear).await.filter(|b| b.len() >= 200) else {
            return Ok(None);
        };
        let info = data.get_info(symbol).await.unwrap_or_default();
        let market_cap = info.market_cap.unwrap_or(0.0);
        if market_cap < MIN_MARKET_CAP {
            return Ok(None);
        }

        let c = closes(&bars);
        let Some(sma200) = sma(&c, 200) else {
            return Ok(None);
        };
        let price = c.last().copied().unwrap_or(0.0);
        let analysts = info.analyst_count.unwrap_or(0);
        let comps = components(&[("trend_strength", trend_strength(price, Some(sma200)))]);
        let score = self.score(&comps);

        Ok(Some(
            AnalysisRecord::new(self.id().as_str(), symbol, week, comps, score, Behavior::Unknown)
                .with_metric("market_cap", market_cap)
                .with_metric("num_analysts", f64::from(analysts))
                .with_metric("sma200", sma200)
                .with_metric("current_price", price)
                .with_metric("above_sma200", f64::from(u8::from(price > sma200)))
                .with_metric("avg_volume", mean(&volumes(&bars)).unwrap_or(0.0))
                .with_metric("quality_score", quality_score(market_cap, analysts)),
        ))
    }
}

#[async_trait]
impl StrategyUnit for MeanReversion {
    fn id(&self) -> StrategyId {
        StrategyId::MeanReversion
    }

    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn universe(&self, weekly_universe: &[String]) -> Vec<String> {
        restrict(&QUALITY_UNIVERSE, weekly_universe)
    }

    async fn analyze(&self, ctx: &AnalyzeContext<'_>) -> TradingResult<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        for symbol in self.universe(ctx.weekly_universe) {
            let result = self.analyze_symbol(&symbol, ctx.week, ctx.data).await;
            if let Some(record) = isolate(self.id(), &symbol, result) {
                records.push(record);
            }
        }
        info!(strategy = %self.id(), analyzed = records.len(), "Quality screen complete");
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
            if record.metric("above_sma200") != Some(1.0) {
                continue;
            }
            let Some(bars) = ctx.data.get_history(&symbol, Period::OneMonth).await else {
                continue;
            };
            let Some(reading) = OversoldReading::from_series(&closes(&bars), &volumes(&bars)) else {
                continue;
            };
            if reading.rsi2 >= self.rsi_entry {
                continue;
            }

            let decision = self.check_no_trade(&symbol, ctx).await;
            if decision.skip {
                out.skip(&symbol, decision);
                continue;
            }

            let comps = reversion_components(&reading, record.metric("sma200"));
            let score = self.score(&comps);
            out.emit(
                Signal::buy(
                    &symbol,
                    self.id(),
                    score,
                    format!("RSI(2) = {:.1}, oversold bounce setup", reading.rsi2),
                )
                .with_components(comps)
                .with_entry(Some(reading.price))
                .with_stop(Some(reading.price * 0.95)),
            );
        }
        out
    }

    async fn check_no_trade(&self, symbol: &str, ctx: &ScanContext<'_>) -> GateDecision {
        let spy_vol = match ctx.data.get_history("SPY", Period::OneMonth).await {
            Some(bars) => annualized_volatility(&closes(&bars)),
            None => None,
        };
        let year = ctx.data.get_history(symbol, Period::OneYear).await.map(|b| closes(&b));
        let below_sma200 = year.as_deref().and_then(|c| Some(*c.last()? < sma(c, 200)?));
        let day_change = year.as_deref().and_then(|c| {
            let n = c.len();
            let prev = *c.get(n.checked_sub(2)?)?;
            (prev > 0.0).then(|| (c[n - 1] - prev) / prev * 100.0)
        });

        let snapshot = GateSnapshot::new(symbol)
            .with_metric("spy_volatility", spy_vol)
            .with_flag("below_sma200", below_sma200)
            .with_metric("day_change_pct", day_change)
            .with_open_position(ctx.is_held(symbol));
        self.gate.evaluate(&snapshot)
    }

    fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }

    async fn exit_context(&self, symbol: &str, data: &dyn MarketData, now: MarketTime) -> ExitContext {
        let rsi2 = match data.get_history(symbol, Period::OneMonth).await {
            Some(bars) => rsi_simple(&closes(&bars), 2),
            None => None,
        };
        ExitContext::new(now).with_metric("rsi2", rsi2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::daily_series;
    use crate::data::{InMemoryMarketData, InstrumentInfo};
    use crate::clock::New_York;
    use chrono::{NaiveDate, TimeZone};
    use std::collections::{HashMap, HashSet};

    fn reading(rsi2: f64, drawdown_pct: f64, volume_spike: f64) -> OversoldReading {
        OversoldReading {
            rsi2,
            price: 100.0,
            drawdown_pct,
            volume_spike,
        }
    }

    #[test]
    fn test_components_deep_oversold() {
        let c = reversion_components(&reading(3.0, -16.0, 3.5), Some(80.0));
        assert_eq!(c["rsi_extremity"], 1.0);
        assert_eq!(c["trend_strength"], 1.0);
        assert_eq!(c["drawdown_depth"], 1.0);
        assert_eq!(c["volume_spike"], 1.0);
        assert_eq!(MeanReversion::new(None).score(&c), 5);
    }

    #[test]
    fn test_components_mild() {
        let c = reversion_components(&reading(12.0, -2.0, 1.0), Some(98.0));
        assert_eq!(c["rsi_extremity"], 0.6);
        assert_eq!(c["trend_strength"], 0.6);
        assert_eq!(c["drawdown_depth"], 0.4);
        assert_eq!(c["volume_spike"], 0.4);
    }

    #[test]
    fn test_quality_score() {
        assert!((quality_score(200e9, 40) - 1.0).abs() < 1e-9);
        assert!((quality_score(50e9, 10) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_reading_needs_fourteen_bars() {
        let closes = vec![100.0; 13];
        assert!(OversoldReading::from_series(&closes, &closes).is_none());
    }

    #[tokio::test]
    async fn test_analyze_skips_small_caps() {
        let md = InMemoryMarketData::new();
        let last = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();
        let closes: Vec<f64> = (0..220).map(|i| 100.0 + i as f64 * 0.1).collect();
        for (symbol, cap) in [("AAPL", 3e12), ("MSFT", 5e9)] {
            md.set_daily(symbol, daily_series(last, &closes, 1e6));
            md.set_info(InstrumentInfo {
                symbol: symbol.into(),
                market_cap: Some(cap),
                analyst_count: Some(30),
                ..Default::default()
            });
        }
        let week = WeekId::for_date(last);
        let universe = vec!["AAPL".to_string(), "MSFT".to_string()];
        let ctx = AnalyzeContext {
            data: &md,
            week: &week,
            weekly_universe: &universe,
            now: New_York.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap(),
        };
        let records = MeanReversion::new(None).analyze(&ctx).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, "AAPL");
        assert_eq!(records[0].metric("above_sma200"), Some(1.0));
    }

    #[tokio::test]
    async fn test_scan_without_records_emits_nothing() {
        let md = InMemoryMarketData::new();
        let week = WeekId::parse("2026-W10").unwrap();
        let records = HashMap::new();
        let open = HashSet::new();
        let ctx = ScanContext {
            data: &md,
            week: &week,
            records: &records,
            weekly_universe: &[],
            open_symbols: &open,
            now: New_York.with_ymd_and_hms(2026, 3, 9, 9, 45, 0).unwrap(),
        };
        let out = MeanReversion::new(None).scan(&ctx).await;
        assert!(out.signals.is_empty());
    }
}
