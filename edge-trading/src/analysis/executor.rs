//! Earnings-week execution.
//!
//! Reads only what the weekend froze: today's candidates and their
//! analysis records. Live data is used for release detection and the
//! NO-TRADE gate, never to re-score.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tracing::debug;

use edge_common::config::TradingConfig;

use super::{AnalysisRecord, Candidate};
use crate::clock::MarketTime;
use crate::data::{MarketData, Period, ReleaseTime};
use crate::indicators;
use crate::strategy::no_trade::metric;
use crate::strategy::{GateDecision, GateSnapshot, InvalidationEngine, NoTradeGate, Signal, StrategyId};

/// Headline words that mean the numbers are out.
const RELEASE_KEYWORDS: &[&str] = &["earnings", "results", "reports", "beats", "misses", "profit"];

/// Headlines checked for a release.
const RELEASE_NEWS_LIMIT: usize = 5;

/// Whether today's release has happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReleaseStatus {
    Released { evidence: String },
    Pending,
}

impl ReleaseStatus {
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released { .. })
    }
}

/// Trade or skip, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum EarningsDecision {
    Trade { score: u8, reason: String },
    Skip { score: u8, reasons: Vec<String> },
}

impl EarningsDecision {
    /// Score and behaviour rule applied after the gate passed.
    ///
    /// Score 4-5 always trades. Score 3 trades only with a clear
    /// continuation or fade history.
    pub fn from_record(record: &AnalysisRecord) -> Self {
        let score = record.final_score;
        let behavior = record.behavior;
        match score {
            s if s >= 4 => Self::Trade {
                score,
                reason: if behavior.is_clear() {
                    format!("Score {}/5 with {} pattern", score, behavior)
                } else {
                    format!("High score ({}/5) despite {} pattern", score, behavior)
                },
            },
            3 if behavior.is_clear() => Self::Trade {
                score,
                reason: format!("Medium score (3/5) with clear {} pattern", behavior),
            },
            3 => Self::Skip {
                score,
                reasons: vec![format!("Medium score but {} pattern", behavior)],
            },
            _ => Self::Skip {
                score,
                reasons: vec![format!("Low score ({}/5)", score)],
            },
        }
    }

    pub fn score(&self) -> u8 {
        match self {
            Self::Trade { score, .. } | Self::Skip { score, .. } => *score,
        }
    }
}

/// Earnings entry logic plus its exit rules.
pub struct EarningsExecutor {
    gate: NoTradeGate,
    exits: InvalidationEngine,
    position_pct: f64,
}

impl EarningsExecutor {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            gate: NoTradeGate::canonical(&config.no_trade),
            exits: InvalidationEngine::global(&config.invalidation),
            position_pct: config.risk.max_position_pct,
        }
    }

    pub fn exit_rules(&self) -> &InvalidationEngine {
        &self.exits
    }

    pub fn position_pct(&self) -> f64 {
        self.position_pct
    }

    /// Candidates reporting on `today`.
    pub fn todays<'a>(candidates: &'a [Candidate], today: NaiveDate) -> Vec<&'a Candidate> {
        candidates.iter().filter(|c| c.date == today).collect()
    }

    /// News mention first, then the scheduled release time.
    pub async fn release_status(&self, candidate: &Candidate, data: &dyn MarketData, now: &MarketTime) -> ReleaseStatus {
        let news = data.get_news(&candidate.symbol, RELEASE_NEWS_LIMIT).await;
        if let Some(item) = news.iter().find(|n| {
            let title = n.headline.to_lowercase();
            RELEASE_KEYWORDS.iter().any(|kw| title.contains(kw))
        }) {
            return ReleaseStatus::Released {
                evidence: item.headline.clone(),
            };
        }

        let t = now.time();
        let expected = match candidate.time {
            ReleaseTime::Bmo if t > NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN) => Some("bmo"),
            ReleaseTime::Amc if t > NaiveTime::from_hms_opt(16, 30, 0).unwrap_or(NaiveTime::MIN) => Some("amc"),
            _ => None,
        };
        match expected {
            Some(when) => ReleaseStatus::Released {
                evidence: format!("Expected ({})", when),
            },
            None => ReleaseStatus::Pending,
        }
    }

    /// Evaluate the canonical gate for one candidate against live data.
    pub async fn check_no_trade(
        &self,
        symbol: &str,
        record: Option<&AnalysisRecord>,
        held: bool,
        data: &dyn MarketData,
    ) -> GateDecision {
        let info = data.get_info(symbol).await;
        let gap = data.get_history(symbol, Period::FiveDays).await.and_then(|bars| {
            let closes = indicators::closes(&bars);
            match closes.as_slice() {
                [.., prev, last] => indicators::gap_pct(*prev, *last),
                _ => None,
            }
        });

        let snapshot = GateSnapshot::new(symbol)
            .with_metric(metric::AVG_VOLUME, info.as_ref().and_then(|i| i.average_volume))
            .with_metric(metric::GAP_PCT, gap)
            .with_metric(metric::MARKET_CAP, info.as_ref().and_then(|i| i.market_cap))
            .with_record(record)
            .with_open_position(held);
        self.gate.evaluate(&snapshot)
    }

    /// Gate, then the score rule.
    pub async fn evaluate(
        &self,
        candidate: &Candidate,
        record: Option<&AnalysisRecord>,
        held: bool,
        data: &dyn MarketData,
    ) -> EarningsDecision {
        let Some(record) = record else {
            return EarningsDecision::Skip {
                score: 0,
                reasons: vec!["No frozen analysis for this week".into()],
            };
        };

        let gate = self.check_no_trade(&candidate.symbol, Some(record), held, data).await;
        if gate.skip {
            debug!(symbol = %candidate.symbol, reasons = %gate.summary(), "Earnings NO-TRADE");
            return EarningsDecision::Skip {
                score: record.final_score,
                reasons: gate.reasons,
            };
        }
        EarningsDecision::from_record(record)
    }

    /// BUY signal for a trade decision.
    pub fn signal(candidate: &Candidate, record: &AnalysisRecord, decision: &EarningsDecision) -> Option<Signal> {
        match decision {
            EarningsDecision::Trade { score, reason } => Some(
                Signal::buy(&candidate.symbol, StrategyId::Earnings, *score, reason.clone())
                    .with_components(record.components.clone()),
            ),
            EarningsDecision::Skip { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Behavior;
    use crate::clock::{New_York, WeekId};
    use crate::data::memory::daily_series;
    use crate::data::{InMemoryMarketData, InstrumentInfo, NewsItem};
    use crate::strategy::Components;
    use chrono::TimeZone;

    fn week() -> WeekId {
        WeekId::parse("2026-W10").unwrap()
    }

    fn candidate(symbol: &str, time: ReleaseTime) -> Candidate {
        Candidate {
            week_id: week(),
            symbol: symbol.into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            time,
            eps_estimate: None,
            revenue_estimate: None,
        }
    }

    fn record(score: u8, behavior: Behavior) -> AnalysisRecord {
        AnalysisRecord::new("earnings", "AAPL", &week(), Components::new(), score, behavior)
    }

    fn executor() -> EarningsExecutor {
        EarningsExecutor::new(&TradingConfig::default())
    }

    fn liquid(data: &InMemoryMarketData, symbol: &str) {
        data.set_info(InstrumentInfo {
            symbol: symbol.into(),
            market_cap: Some(2e12),
            average_volume: Some(5e7),
            ..Default::default()
        });
        data.set_daily(symbol, daily_series(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(), &[100.0, 101.0, 102.0], 5e7));
    }

    #[test]
    fn test_score_rule() {
        assert!(matches!(
            EarningsDecision::from_record(&record(4, Behavior::Mixed)),
            EarningsDecision::Trade { .. }
        ));
        assert!(matches!(
            EarningsDecision::from_record(&record(3, Behavior::Continuation)),
            EarningsDecision::Trade { .. }
        ));
        assert!(matches!(
            EarningsDecision::from_record(&record(3, Behavior::Mixed)),
            EarningsDecision::Skip { .. }
        ));
        assert!(matches!(
            EarningsDecision::from_record(&record(2, Behavior::Fade)),
            EarningsDecision::Skip { .. }
        ));
    }

    #[test]
    fn test_todays_candidates() {
        let list = vec![candidate("AAPL", ReleaseTime::Bmo), candidate("MSFT", ReleaseTime::Amc)];
        assert_eq!(EarningsExecutor::todays(&list, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()).len(), 2);
        assert!(EarningsExecutor::todays(&list, NaiveDate::from_ymd_opt(2026, 3, 11).unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_release_detection() {
        let data = InMemoryMarketData::new();
        let ex = executor();
        let morning = New_York.with_ymd_and_hms(2026, 3, 10, 9, 45, 0).unwrap();
        let late = New_York.with_ymd_and_hms(2026, 3, 10, 10, 15, 0).unwrap();

        let bmo = candidate("AAPL", ReleaseTime::Bmo);
        assert_eq!(ex.release_status(&bmo, &data, &morning).await, ReleaseStatus::Pending);
        assert!(ex.release_status(&bmo, &data, &late).await.is_released());

        let amc = candidate("MSFT", ReleaseTime::Amc);
        assert_eq!(ex.release_status(&amc, &data, &late).await, ReleaseStatus::Pending);
        data.set_news(
            "MSFT",
            vec![NewsItem {
                headline: "Microsoft reports record quarter".into(),
                source: "wire".into(),
                published_at: late.with_timezone(&chrono::Utc),
                url: None,
            }],
        );
        assert!(ex.release_status(&amc, &data, &late).await.is_released());
    }

    #[tokio::test]
    async fn test_gate_fails_closed_without_info() {
        let data = InMemoryMarketData::new();
        let r = record(5, Behavior::Continuation);
        let decision = executor().evaluate(&candidate("AAPL", ReleaseTime::Bmo), Some(&r), false, &data).await;
        match decision {
            EarningsDecision::Skip { reasons, .. } => assert!(reasons.len() >= 3),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_liquid_high_score_trades() {
        let data = InMemoryMarketData::new();
        liquid(&data, "AAPL");
        let c = candidate("AAPL", ReleaseTime::Bmo);
        let r = record(5, Behavior::Continuation);
        let decision = executor().evaluate(&c, Some(&r), false, &data).await;
        let signal = EarningsExecutor::signal(&c, &r, &decision).unwrap();
        assert_eq!(signal.strategy_id, StrategyId::Earnings);
        assert_eq!(signal.score, 5);

        let held = executor().evaluate(&c, Some(&r), true, &data).await;
        assert!(matches!(held, EarningsDecision::Skip { .. }));
    }
}
