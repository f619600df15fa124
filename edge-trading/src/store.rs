//! SQLite persistence.
//!
//! # Tables
//! - `universe`, `candidates`: one snapshot per week, replaced wholesale on re-run
//! - `analysis_records`: write-once per `(source, symbol, week_id)`
//! - `positions`: the open-position map (single owner: the scheduler)
//! - `trade_log`, `execution_log`: append-only

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::analysis::{AnalysisRecord, Behavior, Candidate};
use crate::broker::Instrument;
use crate::clock::WeekId;
use crate::data::ReleaseTime;
use crate::execution::Position;
use crate::strategy::{Direction, StrategyId};

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS universe (
    week_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ticker TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    currency TEXT NOT NULL,
    PRIMARY KEY (week_id, symbol)
);

CREATE TABLE IF NOT EXISTS candidates (
    week_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    time TEXT NOT NULL,
    eps_estimate REAL,
    revenue_estimate REAL,
    PRIMARY KEY (week_id, symbol)
);

CREATE TABLE IF NOT EXISTS analysis_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    symbol TEXT NOT NULL,
    week_id TEXT NOT NULL,
    final_score INTEGER NOT NULL,
    behavior TEXT NOT NULL,
    components TEXT NOT NULL,
    metrics TEXT NOT NULL,
    labels TEXT NOT NULL,
    analyzed_at TEXT NOT NULL,
    UNIQUE(source, symbol, week_id)
);

CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    quantity REAL NOT NULL,
    entry_price REAL NOT NULL,
    entry_time TEXT NOT NULL,
    highest_price REAL NOT NULL,
    score INTEGER NOT NULL,
    reason TEXT NOT NULL,
    stop_loss REAL,
    target_price REAL
);

CREATE TABLE IF NOT EXISTS trade_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    symbol TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL NOT NULL,
    pnl REAL,
    reason TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    event TEXT NOT NULL,
    symbol TEXT,
    details TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_week ON analysis_records(week_id, source);
CREATE INDEX IF NOT EXISTS idx_trade_log_ts ON trade_log(ts);
CREATE INDEX IF NOT EXISTS idx_execution_log_ts ON execution_log(ts);
"#;

/// One row of the trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub side: Direction,
    pub quantity: f64,
    pub price: f64,
    /// Realised P&L, sells only
    pub pnl: Option<f64>,
    pub reason: String,
}

/// One row of the execution (decision) log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub symbol: Option<String>,
    pub details: serde_json::Value,
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite store.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so it sits behind a mutex.
/// Every call holds the lock only for the duration of one statement batch.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(db_path = %path.display(), "Store opened");
        Ok(store)
    }

    /// In-memory store (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        debug!("In-memory store created");
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(CREATE_TABLES_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    // ========================================================================
    // Universe
    // ========================================================================

    /// Replace the universe snapshot for `week`.
    pub fn save_universe(&self, week: &WeekId, instruments: &[Instrument]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM universe WHERE week_id = ?1", params![week.as_str()])?;
        let mut saved = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO universe (week_id, symbol, ticker, name, kind, currency)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for i in instruments {
                saved += stmt.execute(params![week.as_str(), i.symbol, i.ticker, i.name, i.kind, i.currency])?;
            }
        }
        tx.commit()?;
        debug!(week_id = %week, saved, "Universe saved");
        Ok(saved)
    }

    pub fn universe(&self, week: &WeekId) -> Result<Vec<Instrument>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, ticker, name, kind, currency FROM universe WHERE week_id = ?1 ORDER BY symbol",
        )?;
        let rows = stmt.query_map(params![week.as_str()], |row| {
            Ok(Instrument {
                symbol: row.get(0)?,
                ticker: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
                currency: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn universe_symbols(&self, week: &WeekId) -> Result<Vec<String>> {
        Ok(self.universe(week)?.into_iter().map(|i| i.symbol).collect())
    }

    /// Most recent week with a stored universe.
    pub fn latest_universe_week(&self) -> Result<Option<WeekId>> {
        let conn = self.conn()?;
        let week: Option<String> = conn
            .query_row("SELECT MAX(week_id) FROM universe", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(week.and_then(|w| WeekId::parse(&w)))
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    /// Replace the candidate set for `week`.
    pub fn save_candidates(&self, week: &WeekId, candidates: &[Candidate]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM candidates WHERE week_id = ?1", params![week.as_str()])?;
        let mut saved = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO candidates (week_id, symbol, date, time, eps_estimate, revenue_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for c in candidates {
                saved += stmt.execute(params![
                    week.as_str(),
                    c.symbol,
                    c.date.format("%Y-%m-%d").to_string(),
                    c.time.as_str(),
                    c.eps_estimate,
                    c.revenue_estimate,
                ])?;
            }
        }
        tx.commit()?;
        Ok(saved)
    }

    pub fn candidates(&self, week: &WeekId) -> Result<Vec<Candidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, date, time, eps_estimate, revenue_estimate
             FROM candidates WHERE week_id = ?1 ORDER BY date, symbol",
        )?;
        let rows = stmt.query_map(params![week.as_str()], |row| {
            let date: String = row.get(1)?;
            let time: String = row.get(2)?;
            Ok((row.get::<_, String>(0)?, date, time, row.get(3)?, row.get(4)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, date, time, eps_estimate, revenue_estimate) = row?;
            let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
                continue;
            };
            out.push(Candidate {
                week_id: week.clone(),
                symbol,
                date,
                time: ReleaseTime::parse(&time),
                eps_estimate,
                revenue_estimate,
            });
        }
        Ok(out)
    }

    // ========================================================================
    // Analysis Records
    // ========================================================================

    /// Insert records; rows already present for `(source, symbol, week_id)` are left untouched.
    ///
    /// Returns how many rows were actually inserted.
    pub fn insert_analysis(&self, records: &[AnalysisRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO analysis_records
                 (source, symbol, week_id, final_score, behavior, components, metrics, labels, analyzed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in records {
                inserted += stmt.execute(params![
                    r.source,
                    r.symbol,
                    r.week_id.as_str(),
                    i64::from(r.final_score),
                    r.behavior.as_str(),
                    serde_json::to_string(&r.components)?,
                    serde_json::to_string(&r.metrics)?,
                    serde_json::to_string(&r.labels)?,
                    r.analyzed_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(inserted, offered = records.len(), "Analysis records written");
        Ok(inserted)
    }

    /// All records for one source and week.
    pub fn analysis_for(&self, source: &str, week: &WeekId) -> Result<Vec<AnalysisRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source, symbol, week_id, final_score, behavior, components, metrics, labels, analyzed_at
             FROM analysis_records WHERE source = ?1 AND week_id = ?2 ORDER BY final_score DESC, symbol",
        )?;
        let rows = stmt.query_map(params![source, week.as_str()], Self::row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every record for a week, any source.
    pub fn analysis_week(&self, week: &WeekId) -> Result<Vec<AnalysisRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source, symbol, week_id, final_score, behavior, components, metrics, labels, analyzed_at
             FROM analysis_records WHERE week_id = ?1 ORDER BY source, final_score DESC, symbol",
        )?;
        let rows = stmt.query_map(params![week.as_str()], Self::row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn analysis_record(&self, source: &str, symbol: &str, week: &WeekId) -> Result<Option<AnalysisRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT source, symbol, week_id, final_score, behavior, components, metrics, labels, analyzed_at
                 FROM analysis_records WHERE source = ?1 AND symbol = ?2 AND week_id = ?3",
                params![source, symbol, week.as_str()],
                Self::row_to_record,
            )
            .optional()?)
    }

    pub fn count_analysis(&self, source: &str, week: &WeekId) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_records WHERE source = ?1 AND week_id = ?2",
            params![source, week.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<AnalysisRecord, rusqlite::Error> {
        let week: String = row.get(2)?;
        let score: i64 = row.get(3)?;
        let behavior: String = row.get(4)?;
        let components: String = row.get(5)?;
        let metrics: String = row.get(6)?;
        let labels: String = row.get(7)?;
        let analyzed_at: String = row.get(8)?;

        Ok(AnalysisRecord {
            source: row.get(0)?,
            symbol: row.get(1)?,
            week_id: WeekId::parse(&week).unwrap_or_else(|| WeekId::for_date(Utc::now().date_naive())),
            final_score: score.clamp(1, 5) as u8,
            behavior: Behavior::parse(&behavior),
            components: serde_json::from_str(&components).unwrap_or_default(),
            metrics: serde_json::from_str(&metrics).unwrap_or_default(),
            labels: serde_json::from_str(&labels).unwrap_or_default(),
            analyzed_at: parse_ts(&analyzed_at),
        })
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// Insert or update an open position.
    pub fn save_position(&self, p: &Position) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO positions
             (symbol, strategy_id, quantity, entry_price, entry_time, highest_price, score, reason, stop_loss, target_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                p.symbol,
                p.strategy_id.as_str(),
                p.quantity,
                p.entry_price,
                p.entry_time.to_rfc3339(),
                p.highest_price(),
                i64::from(p.score),
                p.reason,
                p.stop_loss,
                p.target_price,
            ],
        )?;
        Ok(())
    }

    pub fn remove_position(&self, symbol: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(removed > 0)
    }

    /// Load persisted positions. All come back OPEN (CLOSING is never persisted).
    pub fn load_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, strategy_id, quantity, entry_price, entry_time, highest_price, score, reason, stop_loss, target_price
             FROM positions ORDER BY entry_time",
        )?;
        let rows = stmt.query_map([], |row| {
            let strategy: String = row.get(1)?;
            let entry_time: String = row.get(4)?;
            let score: i64 = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                strategy,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                entry_time,
                row.get::<_, f64>(5)?,
                score,
                row.get::<_, String>(7)?,
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, Option<f64>>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, strategy, quantity, entry_price, entry_time, highest, score, reason, stop, target) = row?;
            let Some(strategy_id) = StrategyId::parse(&strategy) else {
                tracing::warn!(symbol = %symbol, strategy = %strategy, "Skipping position with unknown strategy");
                continue;
            };
            let mut position = Position::new(
                symbol,
                strategy_id,
                quantity,
                entry_price,
                parse_ts(&entry_time),
                score.clamp(1, 5) as u8,
                reason,
            );
            position.stop_loss = stop;
            position.target_price = target;
            position.ratchet(highest);
            out.push(position);
        }
        Ok(out)
    }

    // ========================================================================
    // Logs
    // ========================================================================

    pub fn log_trade(&self, t: &TradeRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO trade_log (ts, symbol, strategy_id, side, quantity, price, pnl, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                t.ts.to_rfc3339(),
                t.symbol,
                t.strategy_id.as_str(),
                t.side.as_str(),
                t.quantity,
                t.price,
                t.pnl,
                t.reason,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts, symbol, strategy_id, side, quantity, price, pnl, reason
             FROM trade_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(0)?;
            let strategy: String = row.get(2)?;
            let side: String = row.get(3)?;
            Ok(TradeRecord {
                ts: parse_ts(&ts),
                symbol: row.get(1)?,
                strategy_id: StrategyId::parse(&strategy).unwrap_or(StrategyId::Earnings),
                side: Direction::parse(&side),
                quantity: row.get(4)?,
                price: row.get(5)?,
                pnl: row.get(6)?,
                reason: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Sum of realised P&L on trades at or after `since`.
    pub fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn()?;
        let pnl: Option<f64> = conn.query_row(
            "SELECT SUM(pnl) FROM trade_log WHERE ts >= ?1 AND pnl IS NOT NULL",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(pnl.unwrap_or(0.0))
    }

    /// Number of trades at or after `since`.
    pub fn trade_count_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trade_log WHERE ts >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn log_execution(&self, event: &str, symbol: Option<&str>, details: &serde_json::Value) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO execution_log (ts, event, symbol, details) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), event, symbol, details.to_string()],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<ExecutionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts, event, symbol, details FROM execution_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(0)?;
            let details: String = row.get(3)?;
            Ok(ExecutionEvent {
                ts: parse_ts(&ts),
                event: row.get(1)?,
                symbol: row.get(2)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
