//! Edge Common - Shared configuration, logging and errors for the Edge trading services.
//!
//! This crate provides:
//! - Configuration types and loading (`~/.edge/config.json` + environment overrides)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup with noise filtering
//! - Small string helpers used by notifications and logs

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    BrokerConfig, Config, EarningsConfig, InvalidationConfig, MarketDataConfig, NewsConfig,
    NoTradeConfig, NotificationConfig, ObservabilityConfig, RiskConfig, ScheduleConfig,
    SizingConfig, StoreConfig, StrategyOverride, TradingConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};
