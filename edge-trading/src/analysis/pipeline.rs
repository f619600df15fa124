//! Weekend pipeline: universe, earnings candidates, frozen analysis.
//!
//! Stages run in order and each gates the next. Every stage can also be run
//! on its own; re-running is safe because the universe and candidate sets are
//! replaced wholesale and analysis records are write-once.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use edge_common::config::TradingConfig;

use super::{Candidate, EarningsAnalyzer, EARNINGS_SOURCE};
use crate::broker::Broker;
use crate::clock::{trading_week_monday, Clock, WeekId};
use crate::data::{clean_symbol, EarningsCalendar, MarketData};
use crate::notification::{NotificationEvent, Notifier};
use crate::store::Store;
use crate::strategy::{AnalyzeContext, StrategyUnit};

/// Pipeline stage selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Universe,
    Earnings,
    Analyze,
    Full,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Universe => "universe",
            Self::Earnings => "earnings",
            Self::Analyze => "analyze",
            Self::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "universe" => Some(Self::Universe),
            "earnings" => Some(Self::Earnings),
            "analyze" | "analysis" => Some(Self::Analyze),
            "full" | "all" => Some(Self::Full),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub ok: bool,
    /// Items written
    pub count: usize,
    /// Items dropped or failed
    pub skipped: usize,
    pub message: String,
}

impl StageReport {
    fn done(stage: Stage, count: usize, skipped: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            ok: true,
            count,
            skipped,
            message: message.into(),
        }
    }

    fn failed(stage: Stage, err: &anyhow::Error) -> Self {
        Self {
            stage,
            ok: false,
            count: 0,
            skipped: 0,
            message: format!("{:#}", err),
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct WeekendReport {
    pub week_id: WeekId,
    pub stages: Vec<StageReport>,
}

impl WeekendReport {
    pub fn ok(&self) -> bool {
        self.stages.iter().all(|s| s.ok)
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

pub struct WeekendPipeline {
    store: Store,
    broker: Arc<dyn Broker>,
    data: Arc<dyn MarketData>,
    calendar: EarningsCalendar,
    analyzer: EarningsAnalyzer,
    units: Vec<Arc<dyn StrategyUnit>>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
}

impl WeekendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        broker: Arc<dyn Broker>,
        data: Arc<dyn MarketData>,
        calendar: EarningsCalendar,
        analyzer: EarningsAnalyzer,
        units: Vec<Arc<dyn StrategyUnit>>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            data,
            calendar,
            analyzer,
            units,
            notifier,
            clock,
        }
    }

    pub fn from_config(
        config: &TradingConfig,
        store: Store,
        broker: Arc<dyn Broker>,
        data: Arc<dyn MarketData>,
        units: Vec<Arc<dyn StrategyUnit>>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let calendar = EarningsCalendar::from_config(&config.earnings, data.clone());
        let analyzer = EarningsAnalyzer::new(&config.earnings);
        Self::new(store, broker, data, calendar, analyzer, units, notifier, clock)
    }

    /// Week the next trading days belong to.
    pub fn week(&self) -> WeekId {
        WeekId::current(self.clock.as_ref())
    }

    /// Run one stage, or all of them with `Stage::Full`.
    pub async fn run(&self, stage: Stage) -> WeekendReport {
        let week = self.week();
        info!(week = %week, stage = %stage, "Weekend pipeline starting");

        let stages = match stage {
            Stage::Full => vec![Stage::Universe, Stage::Earnings, Stage::Analyze],
            single => vec![single],
        };

        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            let result = match stage {
                Stage::Universe => self.refresh_universe(&week).await,
                Stage::Earnings => self.find_candidates(&week).await,
                Stage::Analyze => self.analyze(&week).await,
                Stage::Full => continue,
            };
            match result {
                Ok(report) => {
                    info!(stage = %stage, count = report.count, skipped = report.skipped, "{}", report.message);
                    reports.push(report);
                }
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Weekend stage failed, later stages skipped");
                    self.notifier
                        .notify(NotificationEvent::error(format!("Weekend {} stage failed", stage), &e));
                    reports.push(StageReport::failed(stage, &e));
                    break;
                }
            }
        }

        WeekendReport {
            week_id: week,
            stages: reports,
        }
    }

    /// Stage 1: replace the week's universe with the broker catalogue.
    pub async fn refresh_universe(&self, week: &WeekId) -> Result<StageReport> {
        let instruments = self.broker.instruments().await.context("fetching broker instruments")?;
        if instruments.is_empty() {
            bail!("broker returned an empty instrument catalogue");
        }
        let saved = self.store.save_universe(week, &instruments)?;

        self.notifier.notify(NotificationEvent::UniverseRefreshed {
            week_id: week.clone(),
            count: saved,
        });
        Ok(StageReport::done(
            Stage::Universe,
            saved,
            instruments.len().saturating_sub(saved),
            format!("{} instruments in universe", saved),
        ))
    }

    /// Stage 2: this week's earnings calendar, restricted to the universe.
    pub async fn find_candidates(&self, week: &WeekId) -> Result<StageReport> {
        let universe = self.store.universe_symbols(week)?;
        if universe.is_empty() {
            bail!("no universe for {}, run the universe stage first", week);
        }
        let allowed: HashSet<&str> = universe.iter().map(String::as_str).collect();

        let from = trading_week_monday(self.clock.now().date_naive());
        let to = from + Duration::days(4);
        let events = match self.calendar.fetch(from, to, &universe).await {
            Some((source, events)) => {
                info!(source = %source, count = events.len(), "Earnings events fetched");
                events
            }
            None => Vec::new(),
        };

        let mut invalid = 0;
        let mut outside = 0;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for mut event in events {
            let Some(symbol) = clean_symbol(&event.symbol) else {
                invalid += 1;
                continue;
            };
            if !allowed.contains(symbol.as_str()) {
                outside += 1;
                continue;
            }
            if !seen.insert(symbol.clone()) {
                continue;
            }
            event.symbol = symbol;
            candidates.push(Candidate::from_event(week, event));
        }
        if invalid + outside > 0 {
            info!(invalid, not_tradeable = outside, "Calendar entries dropped");
        }

        let saved = self.store.save_candidates(week, &candidates)?;
        self.notifier.notify(NotificationEvent::CandidatesFound {
            week_id: week.clone(),
            symbols: candidates.iter().map(|c| c.symbol.clone()).collect(),
        });
        Ok(StageReport::done(
            Stage::Earnings,
            saved,
            invalid + outside,
            format!("{} earnings candidates ({} invalid, {} outside universe)", saved, invalid, outside),
        ))
    }

    /// Stage 3: freeze this week's analysis records.
    ///
    /// Earnings candidates are analysed one by one; a failing symbol is
    /// logged and counted, never fatal. Each strategy unit then runs its own
    /// weekend pass, unless it already has records for the week.
    pub async fn analyze(&self, week: &WeekId) -> Result<StageReport> {
        let candidates = self.store.candidates(week)?;
        let universe = self.store.universe_symbols(week)?;

        let mut written = 0;
        let mut failed = 0;

        let mut records = Vec::new();
        let mut frozen = 0;
        for candidate in &candidates {
            if self.store.analysis_record(EARNINGS_SOURCE, &candidate.symbol, week)?.is_some() {
                frozen += 1;
                continue;
            }
            match self.analyzer.analyze(candidate, week, self.data.as_ref()).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(symbol = %candidate.symbol, error = %e, "Earnings analysis failed");
                    failed += 1;
                }
            }
        }
        let inserted = self.store.insert_analysis(&records)?;
        written += inserted;
        if !candidates.is_empty() {
            self.notifier.notify(NotificationEvent::AnalysisComplete {
                week_id: week.clone(),
                source: EARNINGS_SOURCE.into(),
                analyzed: inserted + frozen,
                failed,
            });
        }

        let ctx = AnalyzeContext {
            data: self.data.as_ref(),
            week,
            weekly_universe: &universe,
            now: self.clock.now(),
        };
        for unit in &self.units {
            let source = unit.id().as_str();
            if self.store.count_analysis(source, week)? > 0 {
                info!(strategy = %source, week = %week, "Analysis already frozen for week");
                continue;
            }
            match unit.analyze(&ctx).await {
                Ok(records) => {
                    let inserted = self.store.insert_analysis(&records)?;
                    written += inserted;
                    info!(strategy = %source, records = inserted, "Strategy analysis stored");
                }
                Err(e) => {
                    warn!(strategy = %source, error = %e, "Strategy analysis failed");
                    failed += 1;
                }
            }
        }

        Ok(StageReport::done(
            Stage::Analyze,
            written,
            failed,
            format!("{} analysis records written, {} failures", written, failed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Instrument, PaperBroker};
    use crate::clock::{FixedClock, New_York};
    use crate::data::InMemoryMarketData;
    use chrono::{NaiveDate, TimeZone};

    fn instrument(symbol: &str) -> Instrument {
        Instrument {
            symbol: symbol.into(),
            ticker: format!("{}_US_EQ", symbol),
            name: symbol.into(),
            kind: "STOCK".into(),
            currency: "USD".into(),
        }
    }

    fn pipeline(instruments: Vec<Instrument>, data: Arc<InMemoryMarketData>) -> WeekendPipeline {
        // Saturday 2026-03-07; the trading week starts Monday 2026-03-09
        let clock = Arc::new(FixedClock::new(New_York.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap()));
        let data_dyn: Arc<dyn MarketData> = data;
        let broker = Arc::new(PaperBroker::new(data_dyn.clone(), 10_000.0).with_instruments(instruments));
        WeekendPipeline::from_config(
            &TradingConfig::default(),
            Store::in_memory().unwrap(),
            broker,
            data_dyn,
            Vec::new(),
            Notifier::disabled(),
            clock,
        )
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!(Stage::parse("Full"), Some(Stage::Full));
        assert_eq!(Stage::parse("analysis"), Some(Stage::Analyze));
        assert_eq!(Stage::parse("x"), None);
    }

    #[tokio::test]
    async fn test_earnings_stage_requires_universe() {
        let p = pipeline(vec![], Arc::new(InMemoryMarketData::new()));
        let report = p.run(Stage::Full).await;
        assert!(!report.ok());
        // The failed universe stage stops the run
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].stage, Stage::Universe);
    }

    #[tokio::test]
    async fn test_candidates_restricted_to_universe() {
        let data = Arc::new(InMemoryMarketData::new());
        let tuesday = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        data.set_earnings_dates("AAPL", vec![tuesday]);
        data.set_earnings_dates("MSFT", vec![NaiveDate::from_ymd_opt(2026, 4, 20).unwrap()]);
        let p = pipeline(vec![instrument("AAPL"), instrument("MSFT")], data);

        let report = p.run(Stage::Full).await;
        assert!(report.ok(), "{:?}", report);
        assert_eq!(report.stage(Stage::Earnings).unwrap().count, 1);

        let week = p.week();
        assert_eq!(week.as_str(), "2026-W10");
        let candidates = p.store.candidates(&week).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "AAPL");
        assert_eq!(candidates[0].date, tuesday);

        // No history: the candidate fails in isolation, the stage still succeeds
        let analyze = report.stage(Stage::Analyze).unwrap();
        assert!(analyze.ok);
        assert_eq!(analyze.skipped, 1);
    }
}
