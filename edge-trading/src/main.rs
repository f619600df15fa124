//! Edge Trading - weekly analysis, daily execution.
//!
//! Without flags the service runs the scheduler, news monitor and HTTP API
//! until interrupted. The flags run one piece and exit.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use edge_common::config::Config;
use edge_common::logging::init_logging_with_exclusions;
use edge_trading::analysis::Stage;
use edge_trading::notification::Notifier;
use edge_trading::{TradingContext, TradingService};

#[derive(Parser, Debug)]
#[command(name = "edge-trading")]
#[command(version)]
#[command(about = "Weekly-analysis / daily-execution trading engine", long_about = None)]
struct Cli {
    /// Trade with real money (default is paper)
    #[arg(long)]
    live: bool,

    /// Print account, positions and this week's analysis count
    #[arg(long, conflicts_with_all = ["positions", "weekend", "once"])]
    status: bool,

    /// Print tracked positions
    #[arg(long, conflicts_with_all = ["weekend", "once"])]
    positions: bool,

    /// Run the weekend pipeline now (optionally a single stage)
    #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "full", conflicts_with = "once")]
    weekend: Option<Stage>,

    /// Run a single execution cycle
    #[arg(long)]
    once: bool,

    /// Config file (defaults to ~/.edge/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Start timing immediately for cold-start measurement
    let startup_start = std::time::Instant::now();
    let cli = Cli::parse();

    let mut config = Config::load_with_env(cli.config.as_deref())?;
    if cli.live {
        config.trading.paper_mode = false;
    }
    if let Err(e) = config.validate() {
        eprintln!("{}", edge_common::Error::from(e));
        std::process::exit(2);
    }

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!(
        paper = config.trading.paper_mode,
        "Edge Trading v{}",
        env!("CARGO_PKG_VERSION")
    );
    if !config.trading.paper_mode {
        tracing::warn!("LIVE mode: orders go to the real account");
    }

    if cli.status || cli.positions || cli.once || cli.weekend.is_some() {
        let ctx = TradingContext::from_config(config.trading, Notifier::disabled())?;

        if cli.status {
            let report = ctx.status().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if cli.positions {
            let positions = ctx.store.load_positions()?;
            if positions.is_empty() {
                println!("No open positions");
            }
            for p in &positions {
                println!(
                    "{:<8} {:<16} qty {:>10.4} @ {:>10.2}  stop {:>10}  score {}",
                    p.symbol,
                    p.strategy_id.to_string(),
                    p.quantity,
                    p.entry_price,
                    p.stop_loss.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".into()),
                    p.score,
                );
            }
        } else if let Some(stage) = cli.weekend {
            let report = ctx.run_weekend(stage).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok() {
                std::process::exit(1);
            }
        } else {
            let report = ctx.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    let service = TradingService::new(config.trading);

    // Log startup timing before entering main service loop
    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
