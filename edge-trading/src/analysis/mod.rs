//! Weekend analysis and earnings-driven execution.
//!
//! The weekend pipeline writes one frozen [`AnalysisRecord`] per
//! `(source, symbol, week_id)`. Weekday code only ever reads them.

pub mod earnings;
mod executor;
mod pipeline;

pub use earnings::{EarningsAnalyzer, GapStats};
pub use executor::{EarningsDecision, EarningsExecutor, ReleaseStatus};
pub use pipeline::{Stage, StageReport, WeekendPipeline, WeekendReport};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::clock::WeekId;
use crate::data::{EarningsEvent, ReleaseTime};
use crate::strategy::Components;

/// Source tag for earnings records.
pub const EARNINGS_SOURCE: &str = "earnings";

/// Historical post-event price behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Continuation,
    Fade,
    Mixed,
    #[default]
    Unknown,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Fade => "fade",
            Self::Mixed => "mixed",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "continuation" => Self::Continuation,
            "fade" => Self::Fade,
            "mixed" => Self::Mixed,
            _ => Self::Unknown,
        }
    }

    /// Continuation or fade: a pattern clear enough to act on.
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Continuation | Self::Fade)
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A symbol with an event this week, inside the weekly universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub week_id: WeekId,
    pub symbol: String,
    pub date: NaiveDate,
    pub time: ReleaseTime,
    pub eps_estimate: Option<f64>,
    pub revenue_estimate: Option<f64>,
}

impl Candidate {
    pub fn from_event(week_id: &WeekId, event: EarningsEvent) -> Self {
        Self {
            week_id: week_id.clone(),
            symbol: event.symbol,
            date: event.date,
            time: event.time,
            eps_estimate: event.eps_estimate,
            revenue_estimate: event.revenue_estimate,
        }
    }
}

/// Frozen weekly analysis of one symbol by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// `earnings` or a strategy id
    pub source: String,
    pub symbol: String,
    pub week_id: WeekId,
    pub components: Components,
    /// 1-5
    pub final_score: u8,
    pub behavior: Behavior,
    /// Raw figures behind the components
    pub metrics: BTreeMap<String, f64>,
    /// Categorical annotations (divergence type, sector name, ...)
    pub labels: BTreeMap<String, String>,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn new(
        source: impl Into<String>,
        symbol: impl Into<String>,
        week_id: &WeekId,
        components: Components,
        final_score: u8,
        behavior: Behavior,
    ) -> Self {
        Self {
            source: source.into(),
            symbol: symbol.into(),
            week_id: week_id.clone(),
            components,
            final_score: final_score.clamp(1, 5),
            behavior,
            metrics: BTreeMap::new(),
            labels: BTreeMap::new(),
            analyzed_at: Utc::now(),
        }
    }

    /// Attach a raw metric; non-finite values are dropped.
    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        if value.is_finite() {
            self.metrics.insert(name.to_string(), value);
        }
        self
    }

    pub fn with_label(mut self, name: &str, value: impl Into<String>) -> Self {
        self.labels.insert(name.to_string(), value.into());
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_parse() {
        assert_eq!(Behavior::parse("FADE"), Behavior::Fade);
        assert_eq!(Behavior::parse("whatever"), Behavior::Unknown);
        assert!(Behavior::Continuation.is_clear());
        assert!(!Behavior::Mixed.is_clear());
    }

    #[test]
    fn test_record_builders() {
        let week = WeekId::parse("2026-W10").unwrap();
        let r = AnalysisRecord::new("breakout", "AAPL", &week, Components::new(), 9, Behavior::Unknown)
            .with_metric("pct_from_high", 1.5)
            .with_metric("bad", f64::NAN)
            .with_label("sector", "XLK");
        assert_eq!(r.final_score, 5);
        assert_eq!(r.metric("pct_from_high"), Some(1.5));
        assert_eq!(r.metric("bad"), None);
        assert_eq!(r.label("sector"), Some("XLK"));
    }
}
