//! Execution scheduler.
//!
//! One task owns the position book and the pause state. Each cycle runs in
//! a fixed order:
//!
//! 1. drain operator commands and news advisories
//! 2. invalidation checks on every open position
//! 3. earnings execution for today's released candidates
//! 4. scans of the strategy units whose window is open
//! 5. signal execution, with caps re-checked against the live book
//!
//! Daily summary and the weekend pipeline trigger run after the cycle. The
//! weekend pipeline runs on its own task so commands keep being answered;
//! its report is collected on a later cycle. The news monitor and the HTTP API never touch positions; they submit
//! requests over bounded queues which this task serialises.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use cron::Schedule;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use edge_common::config::TradingConfig;

use crate::analysis::{
    AnalysisRecord, EarningsDecision, EarningsExecutor, Stage, WeekendPipeline, WeekendReport, EARNINGS_SOURCE,
};
use crate::broker::Broker;
use crate::clock::{minutes_since, Clock, MarketHours, MarketTime, New_York, SessionPhase, WeekId};
use crate::commands::{CommandReply, CommandRequest, CommandSender, OperatorCommand};
use crate::data::MarketData;
use crate::error::{TradingError, TradingResult};
use crate::execution::{EntryOutcome, OrderExecutor, Position, PositionBook};
use crate::news::{NewsAdvisory, NewsMonitor, Urgency};
use crate::notification::{NotificationEvent, Notifier};
use crate::store::Store;
use crate::strategy::{Direction, ExitContext, ExitKind, ScanContext, Signal, StrategyId, StrategyUnit};

/// Bounded queue sizes for requests into the scheduler.
const COMMAND_QUEUE: usize = 32;
const ADVISORY_QUEUE: usize = 64;

/// Decision log entries returned by the `Signals` command.
const SIGNAL_LOG_LIMIT: usize = 20;

// ============================================================================
// Status
// ============================================================================

/// Published after every cycle and every command.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: SessionPhase,
    pub week_id: WeekId,
    pub paper_mode: bool,
    pub broker: &'static str,
    pub paused: bool,
    pub loss_halted: bool,
    pub open_positions: usize,
    pub symbols: Vec<String>,
    pub weekend_running: bool,
    pub last_cycle: Option<MarketTime>,
}

/// A signal waiting for execution, with the limits of the unit that made it.
#[derive(Debug, Clone)]
pub struct PendingSignal {
    pub signal: Signal,
    pub position_pct: f64,
    pub max_positions: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub at: MarketTime,
    pub phase: SessionPhase,
    pub exits: Vec<String>,
    pub units_run: Vec<StrategyId>,
    pub signals: usize,
    pub opened: Vec<String>,
    pub skipped: usize,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(at: MarketTime, phase: SessionPhase) -> Self {
        Self {
            at,
            phase,
            exits: Vec::new(),
            units_run: Vec::new(),
            signals: 0,
            opened: Vec::new(),
            skipped: 0,
            error: None,
        }
    }
}

/// Whether a unit's daily window is open: `0 <= now - check_time <= window`.
pub fn in_window(now: &MarketTime, check_time: NaiveTime, window_minutes: i64) -> bool {
    let since = minutes_since(now, check_time);
    (0..=window_minutes).contains(&since)
}

/// Start of the New York calendar day as a UTC instant.
fn day_start_utc(now: &MarketTime) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    New_York
        .from_local_datetime(&midnight)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc) - ChronoDuration::hours(24))
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct ExecutionScheduler {
    clock: Arc<dyn Clock>,
    hours: MarketHours,
    data: Arc<dyn MarketData>,
    store: Store,
    units: Vec<Arc<dyn StrategyUnit>>,
    earnings: EarningsExecutor,
    orders: OrderExecutor,
    notifier: Notifier,
    pipeline: Option<Arc<WeekendPipeline>>,
    news: Option<Arc<NewsMonitor>>,

    paper_mode: bool,
    earnings_max_positions: usize,
    max_daily_loss_pct: f64,
    scan_window: i64,
    summary_at: NaiveTime,
    intervals: [Duration; 3],
    weekend_schedule: Schedule,

    // Owned state, touched only from this task
    book: PositionBook,
    paused: bool,
    halted_on: Option<NaiveDate>,
    day_start_equity: Option<(NaiveDate, f64)>,
    last_run: HashMap<StrategyId, NaiveDate>,
    earnings_done: HashSet<(NaiveDate, String)>,
    flagged: HashMap<String, NewsAdvisory>,
    last_summary: Option<NaiveDate>,
    weekend_cursor: MarketTime,
    weekend_task: Option<JoinHandle<WeekendReport>>,
    last_cycle: Option<MarketTime>,

    commands_tx: CommandSender,
    commands: mpsc::Receiver<CommandRequest>,
    advisories_tx: mpsc::Sender<NewsAdvisory>,
    advisories: mpsc::Receiver<NewsAdvisory>,
    held_tx: watch::Sender<Vec<String>>,
    status_tx: watch::Sender<SchedulerStatus>,
}

impl ExecutionScheduler {
    /// Build the scheduler and restore persisted positions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &TradingConfig,
        clock: Arc<dyn Clock>,
        data: Arc<dyn MarketData>,
        broker: Arc<dyn Broker>,
        store: Store,
        units: Vec<Arc<dyn StrategyUnit>>,
        notifier: Notifier,
    ) -> Result<Self> {
        let weekend_schedule = Schedule::from_str(&config.schedule.weekend_cron)
            .with_context(|| format!("Invalid weekend cron: {}", config.schedule.weekend_cron))?;
        let positions = store.load_positions().context("loading persisted positions")?;
        if !positions.is_empty() {
            info!(count = positions.len(), "Restored open positions");
        }
        let book = PositionBook::from_positions(positions);

        let now = clock.now();
        let (commands_tx, commands) = CommandSender::channel(COMMAND_QUEUE);
        let (advisories_tx, advisories) = mpsc::channel(ADVISORY_QUEUE);
        let (held_tx, _) = watch::channel(book.symbols());
        let status = SchedulerStatus {
            phase: MarketHours::from_config(&config.schedule).phase(&now),
            week_id: WeekId::for_date(now.date_naive()),
            paper_mode: config.paper_mode,
            broker: broker.name(),
            paused: false,
            loss_halted: false,
            open_positions: book.len(),
            symbols: book.symbols(),
            weekend_running: false,
            last_cycle: None,
        };
        let (status_tx, _) = watch::channel(status);

        let orders = OrderExecutor::new(config, broker, data.clone(), store.clone(), notifier.clone());
        let schedule = &config.schedule;

        Ok(Self {
            hours: MarketHours::from_config(schedule),
            data,
            store,
            units,
            earnings: EarningsExecutor::new(config),
            orders,
            notifier,
            pipeline: None,
            news: None,
            paper_mode: config.paper_mode,
            earnings_max_positions: config.risk.max_positions,
            max_daily_loss_pct: config.risk.max_daily_loss_pct,
            scan_window: schedule.scan_window_minutes,
            summary_at: schedule.daily_summary_at(),
            intervals: [
                Duration::from_secs(schedule.market_interval_secs.max(1)),
                Duration::from_secs(schedule.off_hours_interval_secs.max(1)),
                Duration::from_secs(schedule.weekend_interval_secs.max(1)),
            ],
            weekend_schedule,
            book,
            paused: false,
            halted_on: None,
            day_start_equity: None,
            last_run: HashMap::new(),
            earnings_done: HashSet::new(),
            flagged: HashMap::new(),
            last_summary: None,
            weekend_cursor: now,
            weekend_task: None,
            last_cycle: None,
            commands_tx,
            commands,
            advisories_tx,
            advisories,
            held_tx,
            status_tx,
            clock,
        })
    }

    /// Trigger the weekend pipeline from the configured cron.
    pub fn with_pipeline(mut self, pipeline: Arc<WeekendPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Answer `News` commands from this monitor.
    pub fn with_news(mut self, news: Arc<NewsMonitor>) -> Self {
        self.news = Some(news);
        self
    }

    /// Submit side of the command queue.
    pub fn commands(&self) -> CommandSender {
        self.commands_tx.clone()
    }

    /// Where the news monitor sends advisories.
    pub fn advisory_sender(&self) -> mpsc::Sender<NewsAdvisory> {
        self.advisories_tx.clone()
    }

    /// Symbols currently held, updated after every change.
    pub fn held_symbols(&self) -> watch::Receiver<Vec<String>> {
        self.held_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status_tx.subscribe()
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Poll interval for a session phase.
    pub fn interval_for(&self, phase: SessionPhase) -> Duration {
        match phase {
            SessionPhase::MarketOpen => self.intervals[0],
            SessionPhase::OffHours => self.intervals[1],
            SessionPhase::Weekend => self.intervals[2],
        }
    }

    /// Run cycles forever, answering commands while waiting between them.
    pub async fn run(mut self) {
        info!(
            units = self.units.len(),
            positions = self.book.len(),
            broker = self.orders.broker().name(),
            "Execution scheduler started"
        );
        loop {
            let report = self.run_cycle().await;
            let wait = self.interval_for(report.phase);
            debug!(phase = ?report.phase, wait_secs = wait.as_secs(), "Cycle done");

            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                let request = tokio::select! {
                    _ = &mut sleep => break,
                    request = self.commands.recv() => request,
                };
                if let Some(request) = request {
                    self.answer(request).await;
                }
            }
        }
    }

    /// One full cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let now = self.clock.now();
        let phase = self.hours.phase(&now);
        let mut report = CycleReport::new(now, phase);

        while let Ok(request) = self.commands.try_recv() {
            self.answer(request).await;
        }
        while let Ok(advisory) = self.advisories.try_recv() {
            self.flagged.insert(advisory.symbol.clone(), advisory);
        }

        if phase == SessionPhase::MarketOpen {
            if let Err(e) = self.trade(now, &mut report).await {
                error!(error = %e, "Cycle aborted");
                self.notifier.notify(NotificationEvent::error("Execution cycle failed", &e));
                report.error = Some(e.to_string());
            }
        }

        self.daily_summary(now).await;
        self.weekend(now).await;

        self.last_cycle = Some(now);
        self.publish(now);
        report
    }

    /// Market-hours work. Only cycle-fatal errors come back out.
    async fn trade(&mut self, now: MarketTime, report: &mut CycleReport) -> TradingResult<()> {
        self.check_exits(now, report).await?;

        if self.paused {
            debug!("Paused, no new entries");
            return Ok(());
        }
        if self.loss_halted(now).await? {
            return Ok(());
        }

        let mut pending = self.earnings_signals(now, report).await;
        pending.extend(self.scan_due_units(now, report).await);
        report.signals = pending.len();
        self.execute(pending, now, report).await
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Ratchet and evaluate every open position; close on the first rule hit.
    async fn check_exits(&mut self, now: MarketTime, report: &mut CycleReport) -> TradingResult<()> {
        for symbol in self.book.symbols() {
            let Some(position) = self.book.get_mut(&symbol) else {
                continue;
            };
            if !position.is_open() {
                continue;
            }
            let high_before = position.highest_price();

            let decision = if let Some(advisory) = self.flagged.remove(&symbol).filter(|a| a.urgency == Urgency::High) {
                let price = self.data.get_current_price(&symbol).await.unwrap_or(position.entry_price);
                Some((ExitKind::Manual, format!("Urgent news: {}", advisory.headline), price))
            } else {
                let unit = self.units.iter().find(|u| u.id() == position.strategy_id);
                let exit = match unit {
                    Some(unit) => unit.check_invalidation(position, self.data.as_ref(), now).await,
                    // Earnings, manual and disabled-unit positions use the global rules
                    None => match self.data.get_current_price(&symbol).await {
                        Some(price) => self.earnings.exit_rules().evaluate(position, price, &ExitContext::new(now)),
                        None => None,
                    },
                };
                exit.map(|d| (d.kind, d.reason, d.price))
            };

            let Some((kind, reason, price)) = decision else {
                if position.highest_price() > high_before {
                    if let Err(e) = self.store.save_position(position) {
                        warn!(symbol = %symbol, error = %e, "Failed to persist high-water mark");
                    }
                }
                continue;
            };

            info!(symbol = %symbol, strategy = %position.strategy_id, kind = ?kind, price, reason = %reason, "Exit triggered");
            match self.orders.close(&mut self.book, &symbol, kind, &reason, now).await {
                Ok(Some(_)) => report.exits.push(symbol),
                Ok(None) => {}
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => warn!(symbol = %symbol, error = %e, "Exit failed, retrying next cycle"),
            }
        }
        // Medium advisories are informational; they do not outlive the cycle
        self.flagged.clear();
        Ok(())
    }

    // ========================================================================
    // Daily loss limit
    // ========================================================================

    /// Realised losses today beyond the limit pause entries until tomorrow.
    async fn loss_halted(&mut self, now: MarketTime) -> TradingResult<bool> {
        let today = now.date_naive();
        if self.halted_on == Some(today) {
            return Ok(true);
        }
        let realized = match self.store.realized_pnl_since(day_start_utc(&now)) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to read realised P&L");
                0.0
            }
        };
        let start_equity = match self.day_start_equity {
            Some((day, equity)) if day == today => equity,
            _ => {
                let account = self.orders.broker().get_account().await?;
                // Add back what was already realised today
                let equity = account.total_value - realized;
                self.day_start_equity = Some((today, equity));
                equity
            }
        };

        let limit = start_equity * self.max_daily_loss_pct;
        if start_equity > 0.0 && realized <= -limit {
            warn!(realized, limit, "Daily loss limit reached, entries paused for today");
            self.halted_on = Some(today);
            self.notifier.notify(NotificationEvent::Error {
                context: "Daily loss limit".into(),
                message: format!("Realised ${:.2} today, limit ${:.2}. No new entries until tomorrow.", realized, limit),
            });
            self.log_event("LOSS_LIMIT", None, json!({ "realized": realized, "limit": limit }));
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Earnings
    // ========================================================================

    /// BUY signals for today's released earnings candidates.
    async fn earnings_signals(&mut self, now: MarketTime, report: &mut CycleReport) -> Vec<PendingSignal> {
        let today = now.date_naive();
        let week = WeekId::for_date(today);
        let candidates = match self.store.candidates(&week) {
            Ok(c) => c,
            Err(e) => {
                warn!(week = %week, error = %e, "Failed to load candidates");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for candidate in EarningsExecutor::todays(&candidates, today) {
            let key = (today, candidate.symbol.clone());
            if self.earnings_done.contains(&key) {
                continue;
            }
            let status = self.earnings.release_status(candidate, self.data.as_ref(), &now).await;
            if !status.is_released() {
                continue;
            }
            self.earnings_done.insert(key);

            let record = self
                .store
                .analysis_record(EARNINGS_SOURCE, &candidate.symbol, &week)
                .unwrap_or_else(|e| {
                    warn!(symbol = %candidate.symbol, error = %e, "Failed to load earnings record");
                    None
                });
            let held = self.book.contains(&candidate.symbol);
            let decision = self
                .earnings
                .evaluate(candidate, record.as_ref(), held, self.data.as_ref())
                .await;

            match (&decision, record.as_ref()) {
                (EarningsDecision::Trade { .. }, Some(record)) => {
                    if let Some(signal) = EarningsExecutor::signal(candidate, record, &decision) {
                        self.announce(&signal);
                        out.push(PendingSignal {
                            signal,
                            position_pct: self.earnings.position_pct(),
                            max_positions: self.earnings_max_positions,
                        });
                    }
                }
                (EarningsDecision::Skip { reasons, .. }, _) => {
                    report.skipped += 1;
                    self.no_trade(&candidate.symbol, StrategyId::Earnings, reasons.clone());
                }
                _ => {}
            }
        }
        out
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Units whose window is open and that have not run today.
    pub fn due_units(&self, now: &MarketTime) -> Vec<Arc<dyn StrategyUnit>> {
        let today = now.date_naive();
        self.units
            .iter()
            .filter(|u| self.last_run.get(&u.id()) != Some(&today))
            .filter(|u| in_window(now, u.settings().check_time, self.scan_window))
            .cloned()
            .collect()
    }

    async fn scan_due_units(&mut self, now: MarketTime, report: &mut CycleReport) -> Vec<PendingSignal> {
        let due = self.due_units(&now);
        if due.is_empty() {
            return Vec::new();
        }

        let today = now.date_naive();
        let week = WeekId::for_date(today);
        let universe = self.store.universe_symbols(&week).unwrap_or_else(|e| {
            warn!(week = %week, error = %e, "Failed to load weekly universe");
            Vec::new()
        });
        let open_symbols: HashSet<String> = self.book.symbols().into_iter().collect();

        let mut out = Vec::new();
        for unit in due {
            let id = unit.id();
            self.last_run.insert(id, today);
            report.units_run.push(id);

            let records: HashMap<String, AnalysisRecord> = self
                .store
                .analysis_for(id.as_str(), &week)
                .unwrap_or_else(|e| {
                    warn!(strategy = %id, error = %e, "Failed to load frozen records");
                    Vec::new()
                })
                .into_iter()
                .map(|r| (r.symbol.clone(), r))
                .collect();

            let ctx = ScanContext {
                data: self.data.as_ref(),
                week: &week,
                records: &records,
                weekly_universe: &universe,
                open_symbols: &open_symbols,
                now,
            };
            let outcome = unit.scan(&ctx).await;
            info!(
                strategy = %id,
                signals = outcome.signals.len(),
                skipped = outcome.skipped.len(),
                "Scan complete"
            );

            report.skipped += outcome.skipped.len();
            for skipped in outcome.skipped {
                self.no_trade(&skipped.symbol, id, skipped.reasons);
            }
            for signal in outcome.signals {
                self.announce(&signal);
                out.push(PendingSignal {
                    signal,
                    position_pct: unit.settings().position_pct,
                    max_positions: unit.settings().max_positions,
                });
            }
        }
        out
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute signals in order. One failed signal never stops the rest
    /// unless the broker itself is unreachable.
    pub async fn execute(
        &mut self,
        pending: Vec<PendingSignal>,
        now: MarketTime,
        report: &mut CycleReport,
    ) -> TradingResult<()> {
        for PendingSignal {
            signal,
            position_pct,
            max_positions,
        } in pending
        {
            let result = match signal.direction {
                Direction::Buy => self
                    .orders
                    .open(&mut self.book, &signal, position_pct, max_positions, now)
                    .await
                    .map(|outcome| {
                        match &outcome {
                            EntryOutcome::Opened { .. } => report.opened.push(signal.symbol.clone()),
                            EntryOutcome::Skipped { reason } => {
                                debug!(symbol = %signal.symbol, strategy = %signal.strategy_id, reason = %reason, "Entry skipped");
                                self.log_event(
                                    "SKIPPED",
                                    Some(&signal.symbol),
                                    json!({ "strategy": signal.strategy_id, "reason": reason }),
                                );
                            }
                            EntryOutcome::Rejected { .. } => {}
                        }
                    }),
                Direction::Sell => self.close_for_signal(&signal, now).await.map(|_| ()),
                Direction::Hold => Ok(()),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => {
                    warn!(symbol = %signal.symbol, strategy = %signal.strategy_id, error = %e, "Signal dropped");
                    self.log_event(
                        "FAILED",
                        Some(&signal.symbol),
                        json!({ "strategy": signal.strategy_id, "error": e.to_string() }),
                    );
                }
            }
        }
        self.publish(now);
        Ok(())
    }

    /// A SELL closes only a position the same strategy owns.
    async fn close_for_signal(&mut self, signal: &Signal, now: MarketTime) -> TradingResult<bool> {
        let owner = self.book.get(&signal.symbol).map(|p| p.strategy_id);
        if owner != Some(signal.strategy_id) {
            debug!(symbol = %signal.symbol, strategy = %signal.strategy_id, "SELL ignored, not the owner");
            return Ok(false);
        }
        let closed = self
            .orders
            .close(&mut self.book, &signal.symbol, ExitKind::Signal, &signal.reason, now)
            .await?;
        Ok(closed.is_some())
    }

    // ========================================================================
    // Summary and weekend
    // ========================================================================

    async fn daily_summary(&mut self, now: MarketTime) {
        let today = now.date_naive();
        if !MarketHours::is_trading_day(&now) || now.time() < self.summary_at || self.last_summary == Some(today) {
            return;
        }
        self.last_summary = Some(today);

        let since = day_start_utc(&now);
        let trades = self.store.trade_count_since(since).unwrap_or(0);
        let realized_pnl = self.store.realized_pnl_since(since).unwrap_or(0.0);
        let free_cash = match self.orders.broker().get_account().await {
            Ok(account) => account.free_cash,
            Err(e) => {
                warn!(error = %e, "Account unavailable for daily summary");
                0.0
            }
        };
        info!(trades, realized_pnl, open = self.book.len(), "Daily summary");
        self.notifier.notify(NotificationEvent::DailySummary {
            date: today,
            open_positions: self.book.len(),
            trades,
            realized_pnl,
            free_cash,
        });
    }

    /// Whether a weekend cron slot fell between the last check and `now`.
    pub fn weekend_due(&self, now: &MarketTime) -> bool {
        self.weekend_schedule
            .after(&self.weekend_cursor)
            .next()
            .is_some_and(|slot| slot <= *now)
    }

    async fn weekend(&mut self, now: MarketTime) {
        if self.weekend_task.as_ref().is_some_and(JoinHandle::is_finished) {
            self.wait_weekend().await;
        }

        let due = self.weekend_due(&now);
        self.weekend_cursor = now;
        if !due {
            return;
        }
        let Some(pipeline) = self.pipeline.clone() else {
            debug!("Weekend slot reached but no pipeline attached");
            return;
        };
        if self.weekend_running() {
            warn!("Weekend slot reached while the previous run is still going, skipped");
            return;
        }
        info!("Weekend pipeline started in background");
        self.weekend_task = Some(tokio::spawn(async move { pipeline.run(Stage::Full).await }));
    }

    pub fn weekend_running(&self) -> bool {
        self.weekend_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the background weekend run, if any, and log its outcome.
    pub async fn wait_weekend(&mut self) -> Option<WeekendReport> {
        let task = self.weekend_task.take()?;
        match task.await {
            Ok(report) => {
                if report.ok() {
                    info!(week = %report.week_id, "Weekend pipeline finished");
                } else {
                    warn!(week = %report.week_id, "Weekend pipeline finished with failures");
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Weekend pipeline task died");
                self.notifier
                    .notify(NotificationEvent::error("Weekend pipeline task died", &e));
                None
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn answer(&mut self, request: CommandRequest) {
        let command = request.command.clone();
        let now = self.clock.now();
        let reply = match self.handle(command.clone(), now).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(command = %command, error = %e, "Command failed");
                CommandReply::failed(e.to_string())
            }
        };
        if command.is_mutating() {
            self.log_event("COMMAND", None, json!({ "command": command.to_string(), "ok": reply.ok }));
            self.publish(now);
        }
        // The submitter may have timed out
        let _ = request.reply.send(reply);
    }

    /// Execute one operator command against the owned state.
    pub async fn handle(&mut self, command: OperatorCommand, now: MarketTime) -> TradingResult<CommandReply> {
        let week = WeekId::for_date(now.date_naive());
        match command {
            OperatorCommand::Status => {
                let status = self.snapshot(now);
                Ok(CommandReply::ok(format!(
                    "{} | {} | {} open{}",
                    if status.paper_mode { "PAPER" } else { "LIVE" },
                    format!("{:?}", status.phase),
                    status.open_positions,
                    if status.paused || status.loss_halted { " | paused" } else { "" },
                ))
                .with_data(status))
            }
            OperatorCommand::Positions => {
                let mut rows = Vec::with_capacity(self.book.len());
                for p in self.book.snapshot() {
                    let price = self.data.get_current_price(&p.symbol).await;
                    rows.push(json!({
                        "symbol": p.symbol,
                        "strategy": p.strategy_id,
                        "quantity": p.quantity,
                        "entry_price": p.entry_price,
                        "current_price": price,
                        "pnl_pct": price.map(|px| p.pnl_pct(px)),
                        "days_held": p.days_held(&now),
                    }));
                }
                Ok(CommandReply::ok(format!("{} open positions", rows.len())).with_data(rows))
            }
            OperatorCommand::Balance => {
                let account = self.orders.broker().get_account().await?;
                Ok(CommandReply::ok(format!(
                    "Free ${:.2} | Invested ${:.2} | Total ${:.2}",
                    account.free_cash, account.invested, account.total_value
                ))
                .with_data(account))
            }
            OperatorCommand::Trades { limit } => {
                let trades = self.store.recent_trades(limit).map_err(storage)?;
                Ok(CommandReply::ok(format!("{} trades", trades.len())).with_data(trades))
            }
            OperatorCommand::Signals => {
                let events = self.store.recent_executions(SIGNAL_LOG_LIMIT).map_err(storage)?;
                Ok(CommandReply::ok(format!("{} decisions", events.len())).with_data(events))
            }
            OperatorCommand::Buy { symbol, value } => {
                match self.orders.open_manual(&mut self.book, &symbol, value, now).await? {
                    outcome @ EntryOutcome::Opened { .. } => Ok(CommandReply::ok(format!("Bought {}", symbol)).with_data(outcome)),
                    EntryOutcome::Skipped { reason } | EntryOutcome::Rejected { reason } => {
                        Ok(CommandReply::failed(format!("{}: {}", symbol, reason)))
                    }
                }
            }
            OperatorCommand::Sell { symbol } => {
                if self.book.contains(&symbol) {
                    return self.close_reply(&symbol, now).await;
                }
                let order = self.orders.broker().close_position(&symbol).await?;
                Ok(CommandReply::ok(format!("Sold {} {} (untracked)", order.quantity, symbol)).with_data(order))
            }
            OperatorCommand::Close { symbol } => self.close_reply(&symbol, now).await,
            OperatorCommand::CloseAll => {
                let mut closed = Vec::new();
                let mut failed = Vec::new();
                for symbol in self.book.symbols() {
                    match self.orders.close(&mut self.book, &symbol, ExitKind::Manual, "Manual close all", now).await {
                        Ok(Some(_)) => closed.push(symbol),
                        Ok(None) => {}
                        Err(e) => failed.push(format!("{}: {}", symbol, e)),
                    }
                }
                let reply = if failed.is_empty() {
                    CommandReply::ok(format!("Closed {} positions", closed.len()))
                } else {
                    CommandReply::failed(format!("Closed {}, failed: {}", closed.len(), failed.join("; ")))
                };
                Ok(reply.with_data(json!({ "closed": closed, "failed": failed })))
            }
            OperatorCommand::Pause => {
                self.paused = true;
                info!("Entries paused by operator");
                Ok(CommandReply::ok("Paused: exits still run, no new entries"))
            }
            OperatorCommand::Resume => {
                self.paused = false;
                info!("Entries resumed by operator");
                let note = if self.halted_on == Some(now.date_naive()) {
                    " (daily loss limit still active today)"
                } else {
                    ""
                };
                Ok(CommandReply::ok(format!("Resumed{}", note)))
            }
            OperatorCommand::Analysis { symbol } => {
                let records: Vec<AnalysisRecord> = self
                    .store
                    .analysis_week(&week)
                    .map_err(storage)?
                    .into_iter()
                    .filter(|r| r.symbol == symbol)
                    .collect();
                if records.is_empty() {
                    return Ok(CommandReply::failed(format!("No analysis for {} in {}", symbol, week)));
                }
                let summary: Vec<String> = records
                    .iter()
                    .map(|r| format!("{} {}/5 {}", r.source, r.final_score, r.behavior))
                    .collect();
                Ok(CommandReply::ok(format!("{} {}: {}", symbol, week, summary.join(", "))).with_data(records))
            }
            OperatorCommand::News { symbol } => {
                let Some(news) = &self.news else {
                    return Ok(CommandReply::failed("News monitor disabled"));
                };
                let report = news.report(&symbol, now.with_timezone(&Utc)).await;
                Ok(CommandReply::ok(format!("{}: {}", symbol, report.signal)).with_data(report))
            }
            OperatorCommand::Universe => {
                let symbols = self.store.universe_symbols(&week).map_err(storage)?;
                Ok(CommandReply::ok(format!("{} symbols in {}", symbols.len(), week)).with_data(symbols))
            }
        }
    }

    async fn close_reply(&mut self, symbol: &str, now: MarketTime) -> TradingResult<CommandReply> {
        match self.orders.close(&mut self.book, symbol, ExitKind::Manual, "Manual close", now).await? {
            Some(trade) => Ok(CommandReply::ok(format!(
                "Closed {} at ${:.2} ({:+.2}%)",
                symbol, trade.exit_price, trade.pnl_pct
            ))
            .with_data(trade)),
            None => Ok(CommandReply::failed(format!("No open position in {}", symbol))),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn snapshot(&self, now: MarketTime) -> SchedulerStatus {
        SchedulerStatus {
            phase: self.hours.phase(&now),
            week_id: WeekId::for_date(now.date_naive()),
            paper_mode: self.paper_mode,
            broker: self.orders.broker().name(),
            paused: self.paused,
            loss_halted: self.halted_on == Some(now.date_naive()),
            open_positions: self.book.len(),
            symbols: self.book.symbols(),
            weekend_running: self.weekend_running(),
            last_cycle: self.last_cycle,
        }
    }

    fn publish(&self, now: MarketTime) {
        let symbols = self.book.symbols();
        self.held_tx.send_if_modified(|held| {
            if *held == symbols {
                false
            } else {
                *held = symbols.clone();
                true
            }
        });
        self.status_tx.send_replace(self.snapshot(now));
    }

    fn announce(&self, signal: &Signal) {
        info!(
            symbol = %signal.symbol,
            strategy = %signal.strategy_id,
            direction = %signal.direction,
            score = signal.score,
            reason = %signal.reason,
            "Signal"
        );
        self.log_event(
            "SIGNAL",
            Some(&signal.symbol),
            json!({
                "strategy": signal.strategy_id,
                "direction": signal.direction,
                "score": signal.score,
                "reason": signal.reason,
                "components": signal.components,
            }),
        );
        self.notifier.notify(NotificationEvent::SignalGenerated { signal: signal.clone() });
    }

    fn no_trade(&self, symbol: &str, strategy: StrategyId, reasons: Vec<String>) {
        self.log_event("NO_TRADE", Some(symbol), json!({ "strategy": strategy, "reasons": reasons }));
        self.notifier.notify(NotificationEvent::NoTrade {
            symbol: symbol.to_string(),
            strategy,
            reasons,
        });
    }

    fn log_event(&self, event: &str, symbol: Option<&str>, details: serde_json::Value) {
        if let Err(e) = self.store.log_execution(event, symbol, &details) {
            warn!(event, error = %e, "Failed to write decision log");
        }
    }

    /// Positions the scheduler owns, for tests and start-up reporting.
    pub fn positions(&self) -> Vec<Position> {
        self.book.snapshot()
    }
}

fn storage(e: anyhow::Error) -> TradingError {
    TradingError::Validation(format!("store: {:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Behavior, Candidate};
    use crate::broker::PaperBroker;
    use crate::clock::FixedClock;
    use crate::data::memory::daily_series;
    use crate::data::{InMemoryMarketData, InstrumentInfo, ReleaseTime};
    use crate::strategy::{build_units, Components};

    struct Harness {
        clock: Arc<FixedClock>,
        data: Arc<InMemoryMarketData>,
        store: Store,
        scheduler: ExecutionScheduler,
    }

    fn at(d: u32, h: u32, m: u32) -> MarketTime {
        New_York.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn harness(now: MarketTime, units: Vec<Arc<dyn StrategyUnit>>) -> Harness {
        let clock = Arc::new(FixedClock::new(now));
        let data = Arc::new(InMemoryMarketData::new());
        let store = Store::in_memory().unwrap();
        let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(data.clone(), 100_000.0));
        let scheduler = ExecutionScheduler::new(
            &TradingConfig::default(),
            clock.clone(),
            data.clone(),
            broker,
            store.clone(),
            units,
            Notifier::disabled(),
        )
        .unwrap();
        Harness {
            clock,
            data,
            store,
            scheduler,
        }
    }

    fn liquid(data: &InMemoryMarketData, symbol: &str, price: f64) {
        data.set_price(symbol, price);
        data.set_info(InstrumentInfo {
            symbol: symbol.into(),
            market_cap: Some(2e12),
            average_volume: Some(5e7),
            ..Default::default()
        });
        data.set_daily(
            symbol,
            daily_series(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(), &[price, price, price], 5e7),
        );
    }

    #[test]
    fn test_scan_window() {
        let check = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        assert!(!in_window(&at(10, 9, 59), check, 30));
        assert!(in_window(&at(10, 10, 0), check, 30));
        assert!(in_window(&at(10, 10, 30), check, 30));
        assert!(!in_window(&at(10, 10, 31), check, 30));
    }

    #[tokio::test]
    async fn test_interval_by_phase() {
        let h = harness(at(10, 10, 0), Vec::new());
        assert_eq!(h.scheduler.interval_for(SessionPhase::MarketOpen), Duration::from_secs(60));
        assert_eq!(h.scheduler.interval_for(SessionPhase::OffHours), Duration::from_secs(300));
        assert_eq!(h.scheduler.interval_for(SessionPhase::Weekend), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_units_run_once_per_day() {
        let units = build_units(&TradingConfig::default());
        let mut h = harness(at(10, 10, 5), units);

        let first = h.scheduler.run_cycle().await;
        assert!(first.units_run.contains(&StrategyId::VwapReversion));
        assert!(!first.units_run.contains(&StrategyId::SectorMomentum));

        h.clock.set(at(10, 10, 10));
        let second = h.scheduler.run_cycle().await;
        assert!(!second.units_run.contains(&StrategyId::VwapReversion));

        h.clock.set(at(11, 10, 5));
        let next_day = h.scheduler.run_cycle().await;
        assert!(next_day.units_run.contains(&StrategyId::VwapReversion));
    }

    #[tokio::test]
    async fn test_off_hours_cycle_does_not_trade() {
        let units = build_units(&TradingConfig::default());
        let mut h = harness(at(10, 8, 0), units);
        let report = h.scheduler.run_cycle().await;
        assert_eq!(report.phase, SessionPhase::OffHours);
        assert!(report.units_run.is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_exit_runs_first() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        h.data.set_price("AAPL", 100.0);
        let mut book_entry = Position::new("AAPL", StrategyId::Earnings, 5.0, 100.0, at(9, 10, 0).with_timezone(&Utc), 4, "test".into());
        book_entry.stop_loss = None;
        h.store.save_position(&book_entry).unwrap();
        h.scheduler.book.insert(book_entry).unwrap();
        // Paper broker must hold it to sell
        h.scheduler.orders.broker().buy("AAPL", 5.0).await.unwrap();

        h.data.set_price("AAPL", 91.0);
        let report = h.scheduler.run_cycle().await;
        assert_eq!(report.exits, vec!["AAPL".to_string()]);
        assert!(h.scheduler.book().is_empty());
        assert!(h.store.load_positions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_never_fires_without_price() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        let p = Position::new("AAPL", StrategyId::Earnings, 5.0, 100.0, at(9, 10, 0).with_timezone(&Utc), 4, "test".into());
        h.scheduler.book.insert(p).unwrap();
        let report = h.scheduler.run_cycle().await;
        assert!(report.exits.is_empty());
        assert_eq!(h.scheduler.book().len(), 1);
    }

    #[tokio::test]
    async fn test_high_urgency_advisory_closes_position() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        liquid(&h.data, "AAPL", 100.0);
        h.scheduler.orders.broker().buy("AAPL", 1.0).await.unwrap();
        let p = Position::new("AAPL", StrategyId::Earnings, 1.0, 100.0, at(10, 10, 0).with_timezone(&Utc), 4, "test".into());
        h.scheduler.book.insert(p).unwrap();

        h.scheduler
            .advisory_sender()
            .try_send(NewsAdvisory {
                symbol: "AAPL".into(),
                urgency: Urgency::High,
                headline: "Apple faces fraud probe".into(),
                sentiment: -0.8,
            })
            .unwrap();
        let report = h.scheduler.run_cycle().await;
        assert_eq!(report.exits, vec!["AAPL".to_string()]);
    }

    #[tokio::test]
    async fn test_earnings_candidate_executes_after_release() {
        let mut h = harness(at(10, 9, 45), Vec::new());
        liquid(&h.data, "AAPL", 100.0);
        let week = WeekId::for_date(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        h.store
            .save_candidates(
                &week,
                &[Candidate {
                    week_id: week.clone(),
                    symbol: "AAPL".into(),
                    date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
                    time: ReleaseTime::Bmo,
                    eps_estimate: None,
                    revenue_estimate: None,
                }],
            )
            .unwrap();
        h.store
            .insert_analysis(&[AnalysisRecord::new(
                EARNINGS_SOURCE,
                "AAPL",
                &week,
                Components::new(),
                5,
                Behavior::Continuation,
            )])
            .unwrap();

        let before = h.scheduler.run_cycle().await;
        assert!(before.opened.is_empty());

        h.clock.set(at(10, 10, 15));
        let after = h.scheduler.run_cycle().await;
        assert_eq!(after.opened, vec!["AAPL".to_string()]);
        assert_eq!(h.scheduler.book().get("AAPL").unwrap().strategy_id, StrategyId::Earnings);

        h.clock.set(at(10, 10, 20));
        let again = h.scheduler.run_cycle().await;
        assert!(again.opened.is_empty());
    }

    #[tokio::test]
    async fn test_sell_signal_only_closes_owned_position() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        liquid(&h.data, "AAPL", 100.0);
        h.scheduler.orders.broker().buy("AAPL", 1.0).await.unwrap();
        let p = Position::new("AAPL", StrategyId::Breakout, 1.0, 100.0, at(10, 10, 0).with_timezone(&Utc), 4, "test".into());
        h.scheduler.book.insert(p).unwrap();

        let foreign = PendingSignal {
            signal: Signal::new("AAPL", StrategyId::RsiDivergence, Direction::Sell, 4, "bearish"),
            position_pct: 0.1,
            max_positions: 5,
        };
        let mut report = CycleReport::new(at(10, 11, 0), SessionPhase::MarketOpen);
        h.scheduler.execute(vec![foreign], at(10, 11, 0), &mut report).await.unwrap();
        assert!(h.scheduler.book().contains("AAPL"));

        let own = PendingSignal {
            signal: Signal::new("AAPL", StrategyId::Breakout, Direction::Sell, 4, "breakdown"),
            position_pct: 0.1,
            max_positions: 5,
        };
        h.scheduler.execute(vec![own], at(10, 11, 0), &mut report).await.unwrap();
        assert!(!h.scheduler.book().contains("AAPL"));
    }

    #[tokio::test]
    async fn test_pause_blocks_entries_not_exits() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        let reply = h.scheduler.handle(OperatorCommand::Pause, at(10, 11, 0)).await.unwrap();
        assert!(reply.ok);
        assert!(h.scheduler.is_paused());

        liquid(&h.data, "AAPL", 100.0);
        h.scheduler.orders.broker().buy("AAPL", 1.0).await.unwrap();
        let p = Position::new("AAPL", StrategyId::Earnings, 1.0, 100.0, at(9, 10, 0).with_timezone(&Utc), 4, "test".into());
        h.scheduler.book.insert(p).unwrap();
        h.data.set_price("AAPL", 90.0);
        let report = h.scheduler.run_cycle().await;
        assert_eq!(report.exits.len(), 1);

        h.scheduler.handle(OperatorCommand::Resume, at(10, 11, 0)).await.unwrap();
        assert!(!h.scheduler.is_paused());
    }

    #[tokio::test]
    async fn test_manual_buy_and_close_commands() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        liquid(&h.data, "MSFT", 200.0);

        let reply = h
            .scheduler
            .handle(
                OperatorCommand::Buy {
                    symbol: "MSFT".into(),
                    value: 1_000.0,
                },
                at(10, 11, 0),
            )
            .await
            .unwrap();
        assert!(reply.ok, "{}", reply.message);
        assert_eq!(h.scheduler.book().get("MSFT").unwrap().strategy_id, StrategyId::Manual);

        let reply = h
            .scheduler
            .handle(OperatorCommand::Close { symbol: "MSFT".into() }, at(10, 11, 5))
            .await
            .unwrap();
        assert!(reply.ok);
        assert!(h.scheduler.book().is_empty());

        let reply = h
            .scheduler
            .handle(OperatorCommand::Close { symbol: "MSFT".into() }, at(10, 11, 5))
            .await
            .unwrap();
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_daily_loss_limit_halts_entries() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        // 100k equity, 3% limit: a realised loss of 3,500 trips it
        h.store
            .log_trade(&crate::store::TradeRecord {
                ts: at(10, 10, 0).with_timezone(&Utc),
                symbol: "AAPL".into(),
                strategy_id: StrategyId::Breakout,
                side: Direction::Sell,
                quantity: 10.0,
                price: 100.0,
                pnl: Some(-3_500.0),
                reason: "stop".into(),
            })
            .unwrap();
        assert!(h.scheduler.loss_halted(at(10, 11, 0)).await.unwrap());
        assert!(!h.scheduler.loss_halted(at(11, 11, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_weekend_cron_due() {
        let h = harness(at(7, 9, 0), Vec::new());
        assert!(!h.scheduler.weekend_due(&at(7, 9, 59)));
        assert!(h.scheduler.weekend_due(&at(7, 10, 1)));
    }

    /// Paper broker whose catalogue call waits until released.
    struct GatedBroker {
        inner: PaperBroker,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl Broker for GatedBroker {
        fn name(&self) -> &'static str {
            "gated"
        }
        async fn get_account(&self) -> TradingResult<crate::broker::AccountInfo> {
            self.inner.get_account().await
        }
        async fn get_positions(&self) -> TradingResult<Vec<crate::broker::BrokerPosition>> {
            self.inner.get_positions().await
        }
        async fn buy(&self, symbol: &str, quantity: f64) -> TradingResult<crate::broker::OrderResult> {
            self.inner.buy(symbol, quantity).await
        }
        async fn sell(&self, symbol: &str, quantity: f64) -> TradingResult<crate::broker::OrderResult> {
            self.inner.sell(symbol, quantity).await
        }
        async fn is_tradeable(&self, symbol: &str) -> TradingResult<bool> {
            self.inner.is_tradeable(symbol).await
        }
        async fn instruments(&self) -> TradingResult<Vec<crate::broker::Instrument>> {
            self.gate.notified().await;
            self.inner.instruments().await
        }
    }

    #[tokio::test]
    async fn test_weekend_run_does_not_block_commands() {
        let h = harness(at(7, 9, 0), Vec::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let broker = Arc::new(GatedBroker {
            inner: PaperBroker::new(h.data.clone(), 10_000.0),
            gate: gate.clone(),
        });
        let pipeline = WeekendPipeline::from_config(
            &TradingConfig::default(),
            h.store.clone(),
            broker,
            h.data.clone(),
            Vec::new(),
            Notifier::disabled(),
            h.clock.clone(),
        );
        let mut scheduler = h.scheduler.with_pipeline(Arc::new(pipeline));

        h.clock.set(at(7, 10, 1));
        scheduler.run_cycle().await;
        assert!(scheduler.weekend_running());
        assert!(scheduler.status().borrow().weekend_running);

        let reply = scheduler.handle(OperatorCommand::Pause, at(7, 10, 2)).await.unwrap();
        assert!(reply.ok);
        assert!(scheduler.is_paused());

        gate.notify_one();
        let report = scheduler.wait_weekend().await.unwrap();
        // Empty catalogue stops at the universe stage
        assert!(!report.ok());
        assert!(!scheduler.weekend_running());
    }

    #[tokio::test]
    async fn test_held_symbols_published() {
        let mut h = harness(at(10, 11, 0), Vec::new());
        liquid(&h.data, "MSFT", 200.0);
        let held = h.scheduler.held_symbols();
        h.scheduler
            .handle(
                OperatorCommand::Buy {
                    symbol: "MSFT".into(),
                    value: 500.0,
                },
                at(10, 11, 0),
            )
            .await
            .unwrap();
        h.scheduler.run_cycle().await;
        assert_eq!(*held.borrow(), vec!["MSFT".to_string()]);
    }
}
