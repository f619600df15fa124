//! Configuration management for Edge services.
//!
//! All Edge services share one configuration file at `~/.edge/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `T212_API_KEY` → trading.broker.api_key
//! - `T212_API_SECRET` → trading.broker.api_secret
//! - `TELEGRAM_TOKEN` → trading.notification.telegram_token
//! - `TELEGRAM_CHAT_ID` → trading.notification.chat_id
//! - `FMP_API_KEY` → trading.earnings.fmp_api_key
//! - `EDGE_PAPER_MODE` → trading.paper_mode
//! - `EDGE_PORT` → trading.port
//! - `EDGE_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".edge"),
        |dirs| dirs.home_dir().join(".edge"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Parse an `HH:MM` wall-clock time.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Extra tracing targets capped at warn
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Trading 212 broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// API secret
    #[serde(default)]
    pub api_secret: Option<String>,

    /// Override for the REST base URL (tests point this at a mock server)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Attempts per request before giving up
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl BrokerConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

// ============================================================================
// Market Data
// ============================================================================

/// Market data provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Chart API base URL
    #[serde(default = "default_market_data_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_market_data_timeout")]
    pub timeout_secs: u64,

    /// Response cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: i64,

    /// Symbol validation cache TTL in seconds
    #[serde(default = "default_symbol_cache_ttl")]
    pub symbol_cache_ttl_secs: i64,

    /// Attempts per request on 429, 5xx and transport errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts, multiplied by the attempt number
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_market_data_url() -> String {
    "https://query1.finance.yahoo.com".into()
}

fn default_market_data_timeout() -> u64 {
    10
}

fn default_cache_ttl() -> i64 {
    60
}

fn default_symbol_cache_ttl() -> i64 {
    86_400
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: default_market_data_url(),
            timeout_secs: default_market_data_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            symbol_cache_ttl_secs: default_symbol_cache_ttl(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

// ============================================================================
// Earnings Analysis
// ============================================================================

/// Earnings calendar and weekend analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningsConfig {
    /// Financial Modeling Prep API key; without it the calendar falls back to scraping
    #[serde(default)]
    pub fmp_api_key: Option<String>,

    /// FMP base URL
    #[serde(default = "default_fmp_url")]
    pub fmp_base_url: String,

    /// Minimum daily bars required for analysis
    #[serde(default = "default_min_history_bars")]
    pub min_history_bars: usize,

    /// Number of past earnings events inspected
    #[serde(default = "default_max_quarters")]
    pub max_quarters: usize,

    /// Gaps smaller than this (percent) are ignored
    #[serde(default = "default_min_gap_pct")]
    pub min_gap_pct: f64,

    /// Component weight overrides
    #[serde(default)]
    pub weights: Option<HashMap<String, f64>>,

    /// Attempts per calendar request on 429, 5xx and transport errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_fmp_url() -> String {
    "https://financialmodelingprep.com".into()
}

fn default_min_history_bars() -> usize {
    200
}

fn default_max_quarters() -> usize {
    12
}

fn default_min_gap_pct() -> f64 {
    5.0
}

impl Default for EarningsConfig {
    fn default() -> Self {
        Self {
            fmp_api_key: None,
            fmp_base_url: default_fmp_url(),
            min_history_bars: default_min_history_bars(),
            max_quarters: default_max_quarters(),
            min_gap_pct: default_min_gap_pct(),
            weights: None,
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Telegram notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,

    /// Bot token
    #[serde(default)]
    pub telegram_token: Option<String>,

    /// Target chat
    #[serde(default)]
    pub chat_id: Option<String>,

    /// Bot API base URL
    #[serde(default = "default_telegram_url")]
    pub api_base: String,

    /// Bounded queue between the engine and the sender task
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Delivery attempts per message
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Accept operator commands sent to the bot from the configured chat
    #[serde(default = "default_true")]
    pub listen_commands: bool,

    /// Long-poll timeout for `getUpdates`
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".into()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_retry_count() -> u32 {
    3
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            telegram_token: None,
            chat_id: None,
            api_base: default_telegram_url(),
            queue_capacity: default_queue_capacity(),
            retry_count: default_retry_count(),
            listen_commands: true,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Clock and cadence configuration. Times are America/New_York.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression (with seconds) for the weekend pipeline
    #[serde(default = "default_weekend_cron")]
    pub weekend_cron: String,

    #[serde(default = "default_market_open")]
    pub market_open: String,

    #[serde(default = "default_market_close")]
    pub market_close: String,

    /// Loop interval during market hours
    #[serde(default = "default_market_interval")]
    pub market_interval_secs: u64,

    /// Loop interval on weekdays outside market hours
    #[serde(default = "default_off_hours_interval")]
    pub off_hours_interval_secs: u64,

    /// Loop interval on weekends
    #[serde(default = "default_weekend_interval")]
    pub weekend_interval_secs: u64,

    /// Minutes after a unit's check time during which it may still run
    #[serde(default = "default_scan_window")]
    pub scan_window_minutes: i64,

    /// Daily summary is sent once after this time
    #[serde(default = "default_summary_time")]
    pub daily_summary_time: String,
}

fn default_weekend_cron() -> String {
    "0 0 10 * * Sat".into()
}

fn default_market_open() -> String {
    "09:30".into()
}

fn default_market_close() -> String {
    "16:00".into()
}

fn default_market_interval() -> u64 {
    60
}

fn default_off_hours_interval() -> u64 {
    300
}

fn default_weekend_interval() -> u64 {
    3600
}

fn default_scan_window() -> i64 {
    30
}

fn default_summary_time() -> String {
    "16:05".into()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            weekend_cron: default_weekend_cron(),
            market_open: default_market_open(),
            market_close: default_market_close(),
            market_interval_secs: default_market_interval(),
            off_hours_interval_secs: default_off_hours_interval(),
            weekend_interval_secs: default_weekend_interval(),
            scan_window_minutes: default_scan_window(),
            daily_summary_time: default_summary_time(),
        }
    }
}

impl ScheduleConfig {
    pub fn market_open_time(&self) -> NaiveTime {
        parse_hhmm(&self.market_open).unwrap_or(NaiveTime::MIN)
    }

    pub fn market_close_time(&self) -> NaiveTime {
        parse_hhmm(&self.market_close).unwrap_or(NaiveTime::MIN)
    }

    pub fn daily_summary_at(&self) -> NaiveTime {
        parse_hhmm(&self.daily_summary_time).unwrap_or(NaiveTime::MIN)
    }
}

// ============================================================================
// Risk and Sizing
// ============================================================================

/// Account-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum open positions across all strategies
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Cap on a single position as a fraction of free cash
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Realised loss (fraction of starting equity) that halts new entries for the day
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_pct: f64,

    /// Orders smaller than this notional are skipped
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
}

fn default_max_positions() -> usize {
    10
}

fn default_max_position_pct() -> f64 {
    0.10
}

fn default_max_daily_loss() -> f64 {
    0.03
}

fn default_min_notional() -> f64 {
    50.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            max_position_pct: default_max_position_pct(),
            max_daily_loss_pct: default_max_daily_loss(),
            min_notional: default_min_notional(),
        }
    }
}

/// Score → position size multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Index 0 is score 1, index 4 is score 5
    #[serde(default = "default_score_multipliers")]
    pub score_multipliers: [f64; 5],
}

fn default_score_multipliers() -> [f64; 5] {
    [0.0, 0.25, 0.5, 0.75, 1.0]
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            score_multipliers: default_score_multipliers(),
        }
    }
}

impl SizingConfig {
    /// Multiplier for a 1-5 score; out-of-range scores size to zero.
    pub fn multiplier(&self, score: u8) -> f64 {
        match score {
            1..=5 => self.score_multipliers[usize::from(score) - 1],
            _ => 0.0,
        }
    }
}

// ============================================================================
// Gates and Exits
// ============================================================================

/// NO-TRADE gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTradeConfig {
    #[serde(default = "default_min_avg_volume")]
    pub min_avg_volume: f64,

    /// Absolute gap ceiling in percent
    #[serde(default = "default_max_gap_pct")]
    pub max_gap_pct: f64,

    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: f64,
}

fn default_min_avg_volume() -> f64 {
    500_000.0
}

fn default_max_gap_pct() -> f64 {
    15.0
}

fn default_min_market_cap() -> f64 {
    500_000_000.0
}

impl Default for NoTradeConfig {
    fn default() -> Self {
        Self {
            min_avg_volume: default_min_avg_volume(),
            max_gap_pct: default_max_gap_pct(),
            min_market_cap: default_min_market_cap(),
        }
    }
}

/// Global exit rules for earnings-driven positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Hard stop, percent (negative)
    #[serde(default = "default_max_loss_pct")]
    pub max_loss_pct: f64,

    /// Trailing stop, percent drop from the high
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,

    #[serde(default = "default_max_hold_days")]
    pub max_hold_days: i64,

    /// News sentiment at or below this raises a high-urgency advisory
    #[serde(default = "default_sentiment_exit")]
    pub sentiment_exit: f64,
}

fn default_max_loss_pct() -> f64 {
    -8.0
}

fn default_trailing_stop_pct() -> f64 {
    5.0
}

fn default_max_hold_days() -> i64 {
    10
}

fn default_sentiment_exit() -> f64 {
    -0.5
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_loss_pct: default_max_loss_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
            max_hold_days: default_max_hold_days(),
            sentiment_exit: default_sentiment_exit(),
        }
    }
}

// ============================================================================
// News, Store, Strategies
// ============================================================================

/// News monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_news_poll")]
    pub poll_interval_secs: u64,

    /// Minimum seconds between checks of the same symbol
    #[serde(default = "default_news_throttle")]
    pub throttle_secs: i64,

    /// Items older than this are ignored
    #[serde(default = "default_news_max_age")]
    pub max_age_hours: i64,

    /// Negative material news younger than this triggers an advisory
    #[serde(default = "default_alert_window")]
    pub alert_window_minutes: i64,

    /// Advisories younger than this are high urgency
    #[serde(default = "default_high_urgency")]
    pub high_urgency_minutes: i64,

    #[serde(default = "default_advisory_capacity")]
    pub queue_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_news_poll() -> u64 {
    60
}

fn default_news_throttle() -> i64 {
    60
}

fn default_news_max_age() -> i64 {
    24
}

fn default_alert_window() -> i64 {
    30
}

fn default_high_urgency() -> i64 {
    10
}

fn default_advisory_capacity() -> usize {
    64
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_news_poll(),
            throttle_secs: default_news_throttle(),
            max_age_hours: default_news_max_age(),
            alert_window_minutes: default_alert_window(),
            high_urgency_minutes: default_high_urgency(),
            queue_capacity: default_advisory_capacity(),
        }
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database path; `~` is expanded
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.edge/edge.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StoreConfig {
    /// Path with `~` and environment variables expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).into_owned())
    }
}

/// Per-strategy overrides; unset fields keep the strategy's own defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyOverride {
    #[serde(default)]
    pub enabled: Option<bool>,

    /// `HH:MM` New York time
    #[serde(default)]
    pub check_time: Option<String>,

    #[serde(default)]
    pub max_hold_days: Option<i64>,

    #[serde(default)]
    pub max_positions: Option<usize>,

    #[serde(default)]
    pub position_pct: Option<f64>,

    #[serde(default)]
    pub weights: Option<HashMap<String, f64>>,

    /// Strategy-specific tunables, e.g. `fill_fraction` for gap fade
    #[serde(default)]
    pub params: HashMap<String, f64>,
}

// ============================================================================
// Trading
// ============================================================================

/// Trading engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Paper mode uses the demo account (or the in-memory broker without credentials)
    #[serde(default = "default_true")]
    pub paper_mode: bool,

    /// HTTP status API bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP status API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Starting cash for the in-memory paper broker
    #[serde(default = "default_paper_cash")]
    pub paper_cash: f64,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub market_data: MarketDataConfig,

    #[serde(default)]
    pub earnings: EarningsConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub sizing: SizingConfig,

    #[serde(default)]
    pub no_trade: NoTradeConfig,

    #[serde(default)]
    pub invalidation: InvalidationConfig,

    #[serde(default)]
    pub news: NewsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Keyed by strategy id (e.g. "breakout")
    #[serde(default)]
    pub strategies: HashMap<String, StrategyOverride>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4434
}

fn default_paper_cash() -> f64 {
    10_000.0
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            paper_mode: true,
            host: default_host(),
            port: default_port(),
            paper_cash: default_paper_cash(),
            broker: BrokerConfig::default(),
            market_data: MarketDataConfig::default(),
            earnings: EarningsConfig::default(),
            notification: NotificationConfig::default(),
            schedule: ScheduleConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            no_trade: NoTradeConfig::default(),
            invalidation: InvalidationConfig::default(),
            news: NewsConfig::default(),
            store: StoreConfig::default(),
            strategies: HashMap::new(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub trading: TradingConfig,
}

impl Config {
    /// Load from the default path, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration (optionally from `path`) and apply environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        let trading = &mut self.trading;

        if let Ok(key) = std::env::var("T212_API_KEY") {
            trading.broker.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("T212_API_SECRET") {
            trading.broker.api_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_TOKEN") {
            trading.notification.telegram_token = Some(token);
            trading.notification.enabled = true;
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            trading.notification.chat_id = Some(chat);
        }
        if let Ok(key) = std::env::var("FMP_API_KEY") {
            trading.earnings.fmp_api_key = Some(key);
        }
        if let Ok(paper) = std::env::var("EDGE_PAPER_MODE") {
            if let Ok(p) = paper.parse() {
                trading.paper_mode = p;
            }
        }
        if let Ok(port) = std::env::var("EDGE_PORT") {
            if let Ok(p) = port.parse() {
                trading.port = p;
            }
        }
        if let Ok(level) = std::env::var("EDGE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Overrides for one strategy, if configured.
    pub fn strategy(&self, id: &str) -> Option<&StrategyOverride> {
        self.trading.strategies.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.trading.paper_mode);
        assert_eq!(config.trading.port, 4434);
        assert_eq!(config.trading.risk.max_positions, 10);
        assert_eq!(config.trading.no_trade.max_gap_pct, 15.0);
        assert_eq!(config.trading.invalidation.max_loss_pct, -8.0);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"trading": {"port": 9000, "risk": {"max_positions": 4}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.port, 9000);
        assert_eq!(config.trading.risk.max_positions, 4);
        assert_eq!(config.trading.risk.min_notional, 50.0);
        assert_eq!(config.trading.schedule.weekend_cron, "0 0 10 * * Sat");
        assert_eq!(config.trading.market_data.max_attempts, 3);
        assert_eq!(config.trading.earnings.retry_delay_ms, 1_000);
        assert_eq!(config.trading.news.throttle_secs, 60);
    }

    #[test]
    fn test_strategy_override_parsing() {
        let json = r#"{"trading": {"strategies": {"gap_fade": {"max_positions": 1, "params": {"fill_fraction": 0.4}}}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let o = config.strategy("gap_fade").unwrap();
        assert_eq!(o.max_positions, Some(1));
        assert_eq!(o.params.get("fill_fraction"), Some(&0.4));
        assert!(config.strategy("breakout").is_none());
    }

    #[test]
    fn test_sizing_multiplier() {
        let sizing = SizingConfig::default();
        assert_eq!(sizing.multiplier(5), 1.0);
        assert_eq!(sizing.multiplier(3), 0.5);
        assert_eq!(sizing.multiplier(1), 0.0);
        assert_eq!(sizing.multiplier(0), 0.0);
        assert_eq!(sizing.multiplier(6), 0.0);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.trading.paper_cash = 2500.0;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.trading.paper_cash, 2500.0);
    }

    #[test]
    fn test_schedule_times() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.market_open_time(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(schedule.daily_summary_at(), NaiveTime::from_hms_opt(16, 5, 0).unwrap());
        assert!(parse_hhmm("25:00").is_none());
    }

    #[test]
    fn test_store_absolute_path_unchanged() {
        let store = StoreConfig {
            db_path: "/var/lib/edge/edge.db".into(),
        };
        assert_eq!(store.resolved_path(), PathBuf::from("/var/lib/edge/edge.db"));
    }
}
