//! Historical earnings-gap analysis.
//!
//! For each of the last few releases, measure the opening gap and whether
//! price ten sessions later had faded or extended it. The split between
//! fades and continuations becomes the `behavior` of the frozen record.

use serde::Serialize;
use tracing::debug;

use edge_common::config::EarningsConfig;

use super::{AnalysisRecord, Behavior, Candidate, EARNINGS_SOURCE};
use crate::clock::WeekId;
use crate::data::{Bar, InstrumentInfo, MarketData, Period};
use crate::error::{TradingError, TradingResult};
use crate::indicators::{closes, gap_pct, mean, pct_change, return_pct, std_dev};
use crate::strategy::scoring::{self, band, components, Components, Weights};

/// Sessions after the release used to judge the outcome.
const OUTCOME_BARS: usize = 10;

/// A rate above this makes the behaviour dominant.
const DOMINANT_RATE: f64 = 0.6;

/// Outcome of the gap scan over past releases.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GapStats {
    pub gaps: Vec<f64>,
    pub fades: usize,
    pub continuations: usize,
    pub day10_returns: Vec<f64>,
}

impl GapStats {
    /// Scan `earnings_dates` (newest first) against daily `bars` (oldest first).
    ///
    /// Gaps smaller than `min_gap_pct` in absolute terms are ignored, as are
    /// releases without a prior session or ten sessions of follow-through.
    pub fn from_history(bars: &[Bar], earnings_dates: &[chrono::NaiveDate], min_gap_pct: f64, max_quarters: usize) -> Self {
        let mut stats = Self::default();
        for date in earnings_dates.iter().take(max_quarters) {
            let Some(post) = bars.iter().position(|b| b.date() >= *date) else {
                continue;
            };
            if post < 1 || post + OUTCOME_BARS >= bars.len() {
                continue;
            }
            let post_open = bars[post].open;
            let Some(gap) = gap_pct(bars[post - 1].close, post_open) else {
                continue;
            };
            if gap.abs() < min_gap_pct || post_open <= 0.0 {
                continue;
            }
            let day10 = bars[post + OUTCOME_BARS].close;
            stats.gaps.push(gap);
            stats.day10_returns.push((day10 - post_open) / post_open * 100.0);

            let faded = if gap > 0.0 { day10 < post_open } else { day10 > post_open };
            if faded {
                stats.fades += 1;
            } else {
                stats.continuations += 1;
            }
        }
        stats
    }

    pub fn quarters(&self) -> usize {
        self.gaps.len()
    }

    pub fn fade_rate(&self) -> f64 {
        self.rate(self.fades)
    }

    pub fn continuation_rate(&self) -> f64 {
        self.rate(self.continuations)
    }

    fn rate(&self, n: usize) -> f64 {
        let total = self.fades + self.continuations;
        if total == 0 {
            0.0
        } else {
            n as f64 / total as f64
        }
    }

    pub fn avg_gap_pct(&self) -> f64 {
        mean(&self.gaps).unwrap_or(0.0)
    }

    pub fn avg_day10_return(&self) -> f64 {
        mean(&self.day10_returns).unwrap_or(0.0)
    }

    pub fn behavior(&self) -> Behavior {
        if self.gaps.is_empty() {
            Behavior::Unknown
        } else if self.fade_rate() > DOMINANT_RATE {
            Behavior::Fade
        } else if self.continuation_rate() > DOMINANT_RATE {
            Behavior::Continuation
        } else {
            Behavior::Mixed
        }
    }

    /// How predictable the post-release move has been.
    pub fn predictability(&self) -> f64 {
        self.fade_rate().max(self.continuation_rate())
    }
}

/// Pure component computation from the gap scan, fundamentals and closes.
pub fn earnings_components(stats: &GapStats, info: Option<&InstrumentInfo>, closes: &[f64]) -> Components {
    let predictability = stats.predictability();
    let trend_consistency = match stats.quarters() {
        q if q >= 4 => predictability * 0.8 + 0.2,
        q if q >= 2 => predictability * 0.5,
        _ => 0.3,
    };

    let analysts = info.and_then(|i| i.analyst_count).unwrap_or(0);
    let base: f64 = match analysts {
        n if n >= 10 => 0.7,
        n if n >= 5 => 0.5,
        _ => 0.3,
    };
    let bonus: f64 = match info.and_then(|i| i.recommendation.as_deref()) {
        Some("buy" | "strong_buy" | "strongBuy") => 0.2,
        Some("hold") => 0.1,
        _ => 0.0,
    };

    let returns = pct_change(closes);
    let recent = &returns[returns.len().saturating_sub(20)..];
    let volatility_alignment = match (std_dev(recent), std_dev(&returns)) {
        (Some(now), Some(full)) if full > 0.0 => {
            let ratio = now / full;
            if (0.8..=1.2).contains(&ratio) {
                0.8
            } else if (0.5..=1.5).contains(&ratio) {
                0.6
            } else {
                0.4
            }
        }
        _ => 0.5,
    };

    let sentiment_bias = return_pct(closes, 19)
        .map(|r| band(r, &[(5.0, 0.7), (0.0, 0.6), (-5.0, 0.5)], 0.3))
        .unwrap_or(0.5);

    components(&[
        ("gap_behavior", predictability),
        ("trend_consistency", trend_consistency),
        ("analyst_sensitivity", (base + bonus).min(1.0)),
        ("volatility_alignment", volatility_alignment),
        ("sentiment_bias", sentiment_bias),
    ])
}

/// Weekend analyzer for earnings candidates.
#[derive(Debug, Clone)]
pub struct EarningsAnalyzer {
    weights: Weights,
    min_history_bars: usize,
    max_quarters: usize,
    min_gap_pct: f64,
}

impl EarningsAnalyzer {
    pub fn new(config: &EarningsConfig) -> Self {
        let weights = Weights::new(&[
            ("gap_behavior", 0.25),
            ("trend_consistency", 0.20),
            ("analyst_sensitivity", 0.20),
            ("volatility_alignment", 0.15),
            ("sentiment_bias", 0.20),
        ])
        .with_overrides(config.weights.as_ref());
        Self {
            weights,
            min_history_bars: config.min_history_bars,
            max_quarters: config.max_quarters,
            min_gap_pct: config.min_gap_pct,
        }
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Analyse one candidate into a frozen record.
    pub async fn analyze(&self, candidate: &Candidate, week: &WeekId, data: &dyn MarketData) -> TradingResult<AnalysisRecord> {
        let symbol = candidate.symbol.as_str();
        let bars = data
            .get_history(symbol, Period::TwoYears)
            .await
            .filter(|b| b.len() >= self.min_history_bars)
            .ok_or_else(|| TradingError::data_unavailable(symbol, "2y history"))?;

        let earnings = data.get_earnings_dates(symbol).await;
        if earnings.is_empty() {
            debug!(symbol = %symbol, "No earnings history, scoring price action only");
        }
        let stats = GapStats::from_history(&bars, &earnings, self.min_gap_pct, self.max_quarters);
        let info = data.get_info(symbol).await;
        let comps = earnings_components(&stats, info.as_ref(), &closes(&bars));
        let score = scoring::score(&comps, &self.weights);

        let mut record = AnalysisRecord::new(EARNINGS_SOURCE, symbol, week, comps, score, stats.behavior())
            .with_label("date", candidate.date.format("%Y-%m-%d").to_string())
            .with_label("time", candidate.time.as_str())
            .with_metric("avg_gap_pct", stats.avg_gap_pct())
            .with_metric("fade_rate", stats.fade_rate())
            .with_metric("continuation_rate", stats.continuation_rate())
            .with_metric("avg_day10_return", stats.avg_day10_return())
            .with_metric("quarters_analyzed", stats.quarters() as f64);
        if let Some(eps) = candidate.eps_estimate {
            record = record.with_metric("eps_estimate", eps);
        }
        debug!(
            symbol = %symbol,
            score,
            behavior = %record.behavior,
            quarters = stats.quarters(),
            "Earnings analysis complete"
        );
        Ok(record)
    }
}
