//! NO-TRADE gate: hard pre-entry disqualifiers.
//!
//! Filters are independent and all of them run; every triggered reason is
//! reported. A filter whose input is missing counts as triggered, so a
//! data outage can only ever block an entry, never let one through.

use serde::Serialize;
use std::collections::HashMap;

use edge_common::config::NoTradeConfig;

use crate::analysis::{AnalysisRecord, Behavior};

/// Well-known metric names shared by units and the gate.
pub mod metric {
    pub const AVG_VOLUME: &str = "avg_volume";
    pub const GAP_PCT: &str = "gap_pct";
    pub const MARKET_CAP: &str = "market_cap";
}

/// Inputs for one gate evaluation.
#[derive(Debug, Clone)]
pub struct GateSnapshot<'a> {
    pub symbol: &'a str,
    metrics: HashMap<&'static str, f64>,
    pub record: Option<&'a AnalysisRecord>,
    pub has_open_position: bool,
}

impl<'a> GateSnapshot<'a> {
    pub fn new(symbol: &'a str) -> Self {
        Self {
            symbol,
            metrics: HashMap::new(),
            record: None,
            has_open_position: false,
        }
    }

    /// Record a metric. `None` and non-finite values are left out, which the
    /// gate reads as "unavailable".
    pub fn with_metric(mut self, name: &'static str, value: Option<f64>) -> Self {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.metrics.insert(name, v);
        }
        self
    }

    /// Boolean metric, stored as 1.0 / 0.0.
    pub fn with_flag(self, name: &'static str, value: Option<bool>) -> Self {
        self.with_metric(name, value.map(|b| if b { 1.0 } else { 0.0 }))
    }

    pub fn with_record(mut self, record: Option<&'a AnalysisRecord>) -> Self {
        self.record = record;
        self
    }

    pub fn with_open_position(mut self, held: bool) -> Self {
        self.has_open_position = held;
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// One disqualifying condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Average daily volume below the floor
    MinAvgVolume(f64),
    /// Absolute opening gap above the ceiling (percent)
    MaxAbsGap(f64),
    /// Market cap below the floor
    MinMarketCap(f64),
    /// The week's frozen record argues against an entry
    AnalysisConflict,
    /// Already holding the symbol
    AlreadyHeld,
    /// Triggers when `metric > limit`
    Above {
        metric: &'static str,
        limit: f64,
        reason: &'static str,
    },
    /// Triggers when `metric < limit`
    Below {
        metric: &'static str,
        limit: f64,
        reason: &'static str,
    },
    /// Triggers when a boolean metric is set
    Flag {
        metric: &'static str,
        reason: &'static str,
    },
}

impl Filter {
    /// `Some(reason)` when the filter triggers.
    fn check(&self, s: &GateSnapshot<'_>) -> Option<String> {
        match self {
            Self::MinAvgVolume(floor) => match s.metric(metric::AVG_VOLUME) {
                None => Some("Average volume unavailable".into()),
                Some(v) if v < *floor => Some(format!("Low volume ({:.0} < {:.0})", v, floor)),
                Some(_) => None,
            },
            Self::MaxAbsGap(ceiling) => match s.metric(metric::GAP_PCT) {
                None => Some("Gap unavailable".into()),
                Some(g) if g.abs() > *ceiling => Some(format!("Gap too large ({:+.1}%)", g)),
                Some(_) => None,
            },
            Self::MinMarketCap(floor) => match s.metric(metric::MARKET_CAP) {
                None => Some("Market cap unavailable".into()),
                Some(c) if c < *floor => Some(format!("Market cap too small (${:.0}M)", c / 1e6)),
                Some(_) => None,
            },
            Self::AnalysisConflict => match s.record {
                None => Some("No frozen analysis for this week".into()),
                Some(r) if r.final_score <= 2 => Some(format!("Weekend score too low ({}/5)", r.final_score)),
                Some(r) if r.behavior == Behavior::Fade && r.final_score < 4 => {
                    Some(format!("Fade pattern with weak score ({}/5)", r.final_score))
                }
                Some(_) => None,
            },
            Self::AlreadyHeld => s.has_open_position.then(|| "Already holding position".to_string()),
            Self::Above { metric, limit, reason } => match s.metric(metric) {
                None => Some(format!("{} unavailable", metric)),
                Some(v) if v > *limit => Some(format!("{} ({:.1})", reason, v)),
                Some(_) => None,
            },
            Self::Below { metric, limit, reason } => match s.metric(metric) {
                None => Some(format!("{} unavailable", metric)),
                Some(v) if v < *limit => Some(format!("{} ({:.1})", reason, v)),
                Some(_) => None,
            },
            Self::Flag { metric, reason } => match s.metric(metric) {
                None => Some(format!("{} unavailable", metric)),
                Some(v) if v != 0.0 => Some((*reason).to_string()),
                Some(_) => None,
            },
        }
    }
}

/// Gate outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateDecision {
    pub skip: bool,
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn pass() -> Self {
        Self::default()
    }

    /// Reasons joined for logs and notifications.
    pub fn summary(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Ordered filter list.
#[derive(Debug, Clone, Default)]
pub struct NoTradeGate {
    filters: Vec<Filter>,
}

impl NoTradeGate {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    /// The canonical filter set used for earnings entries.
    pub fn canonical(config: &NoTradeConfig) -> Self {
        Self::new(vec![
            Filter::MinAvgVolume(config.min_avg_volume),
            Filter::MaxAbsGap(config.max_gap_pct),
            Filter::MinMarketCap(config.min_market_cap),
            Filter::AnalysisConflict,
            Filter::AlreadyHeld,
        ])
    }

    /// Append a filter.
    pub fn then(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn evaluate(&self, snapshot: &GateSnapshot<'_>) -> GateDecision {
        let reasons: Vec<String> = self.filters.iter().filter_map(|f| f.check(snapshot)).collect();
        GateDecision {
            skip: !reasons.is_empty(),
            reasons,
        }
    }
}
