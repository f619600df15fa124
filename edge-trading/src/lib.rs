//! Edge Trading Library
//!
//! Decision engine for an equities trading bot that separates expensive,
//! stale-tolerant weekly analysis from cheap, time-critical daily execution.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    edge-trading (Rust Service)                      │
//! │                           :4434                                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │ Weekend         │  │ Execution       │  │ News monitor    │      │
//! │  │ Pipeline        │  │ Scheduler       │  │ (advisories)    │      │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘      │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │ Market Data     │  │ Broker          │  │ SQLite Store    │      │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Freeze invariant
//! The weekend pipeline writes one `AnalysisRecord` per source, symbol and
//! week. Weekday execution only reads them; the store refuses overwrites.
//!
//! ## Strategy units
//! Sibling implementations of one trait: `analyze` (weekend), `scan`
//! (weekday), `score`, `check_no_trade` and `check_invalidation`.
//!
//! ## One owner
//! The execution scheduler is the only writer of positions and pause state.
//! The news monitor, the HTTP API and the Telegram command listener submit
//! requests over bounded queues.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod analysis;
pub mod broker;
pub mod clock;
pub mod commands;
pub mod data;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod news;
pub mod notification;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod telegram;

pub use error::{TradingError, TradingResult};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use edge_common::config::TradingConfig;

use crate::analysis::{Stage, WeekendPipeline, WeekendReport};
use crate::broker::{build_broker, AccountInfo, Broker};
use crate::clock::{Clock, MarketHours, SystemClock, WeekId};
use crate::execution::Position;
use crate::data::{MarketData, SymbolValidationCache, YahooMarketData};
use crate::news::NewsMonitor;
use crate::notification::Notifier;
use crate::routes::AppState;
use crate::scheduler::{CycleReport, ExecutionScheduler};
use crate::store::Store;
use crate::strategy::{build_units, StrategyUnit};
use crate::telegram::TelegramCommandListener;

/// One-shot snapshot for the `--status` command.
#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub paper_mode: bool,
    pub broker: &'static str,
    pub week_id: WeekId,
    pub account: AccountInfo,
    pub positions: Vec<Position>,
    pub analysis_records: usize,
}

/// Collaborators shared by every entry point.
pub struct TradingContext {
    pub config: TradingConfig,
    pub clock: Arc<dyn Clock>,
    pub data: Arc<dyn MarketData>,
    pub broker: Arc<dyn Broker>,
    pub store: Store,
    pub units: Vec<Arc<dyn StrategyUnit>>,
    pub notifier: Notifier,
}

impl TradingContext {
    /// Wire the production collaborators from configuration.
    pub fn from_config(config: TradingConfig, notifier: Notifier) -> Result<Self> {
        let symbols = Arc::new(SymbolValidationCache::new(config.market_data.symbol_cache_ttl_secs));
        let data: Arc<dyn MarketData> = Arc::new(YahooMarketData::new(&config.market_data, symbols));
        let broker = build_broker(&config, data.clone()).context("building broker gateway")?;
        let store = Store::open(config.store.resolved_path())?;
        let units = build_units(&config);
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            data,
            broker,
            store,
            units,
            notifier,
        })
    }

    pub fn pipeline(&self) -> WeekendPipeline {
        WeekendPipeline::from_config(
            &self.config,
            self.store.clone(),
            self.broker.clone(),
            self.data.clone(),
            self.units.clone(),
            self.notifier.clone(),
            self.clock.clone(),
        )
    }

    pub fn scheduler(&self) -> Result<ExecutionScheduler> {
        ExecutionScheduler::new(
            &self.config,
            self.clock.clone(),
            self.data.clone(),
            self.broker.clone(),
            self.store.clone(),
            self.units.clone(),
            self.notifier.clone(),
        )
    }

    /// Run weekend stages once.
    pub async fn run_weekend(&self, stage: Stage) -> WeekendReport {
        self.pipeline().run(stage).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let week_id = WeekId::current(self.clock.as_ref());
        let account = self.broker.get_account().await?;
        Ok(StatusReport {
            paper_mode: self.config.paper_mode,
            broker: self.broker.name(),
            analysis_records: self.store.analysis_week(&week_id)?.len(),
            positions: self.store.load_positions()?,
            week_id,
            account,
        })
    }

    /// Run a single execution cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut scheduler = self.scheduler()?;
        Ok(scheduler.run_cycle().await)
    }
}

/// Main trading service: scheduler, news monitor, Telegram notifications and commands, HTTP API.
pub struct TradingService {
    config: TradingConfig,
}

impl TradingService {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Start every task and serve HTTP until the process is stopped.
    pub async fn start(self) -> Result<()> {
        let notifier = Notifier::spawn(&self.config.notification);
        let ctx = TradingContext::from_config(self.config, notifier)?;
        let config = &ctx.config;

        let mut scheduler = ctx.scheduler()?.with_pipeline(Arc::new(ctx.pipeline()));

        if config.news.enabled {
            let news = Arc::new(NewsMonitor::new(ctx.data.clone(), config.news.clone()).with_fmp(&config.earnings));
            scheduler = scheduler.with_news(news.clone());
            let hours = MarketHours::from_config(&config.schedule);
            tokio::spawn(news.run(
                ctx.clock.clone(),
                hours,
                scheduler.held_symbols(),
                scheduler.advisory_sender(),
                ctx.notifier.clone(),
            ));
        }

        if let Some(listener) = TelegramCommandListener::from_config(&config.notification) {
            tokio::spawn(listener.run(scheduler.commands(), ctx.notifier.clone()));
        }

        let state = AppState {
            store: ctx.store.clone(),
            status: scheduler.status(),
            commands: scheduler.commands(),
        };
        tokio::spawn(scheduler.run());

        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
        let app = routes::build_router(state).layer(cors);

        let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
        tracing::info!(address = %addr, paper = config.paper_mode, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await?;

        Ok(())
    }
}
