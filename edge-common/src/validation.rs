//! Configuration validation for Edge services.
//!
//! Run once at start-up; any failure is fatal.

use std::str::FromStr;
use thiserror::Error;

use crate::config::{
    parse_hhmm, Config, InvalidationConfig, ObservabilityConfig, RiskConfig, ScheduleConfig,
    SizingConfig, StrategyOverride, TradingConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Collapse collected errors into one result.
fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.trading.validate() {
            errors.push(e);
        }
        collect(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "observability.log_level",
                format!("must be one of {:?}", LEVELS),
            ));
        }
        Ok(())
    }
}

impl Validate for TradingConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if !self.paper_mode && !self.broker.has_credentials() {
            errors.push(ValidationError::MissingField {
                field: "trading.broker.api_key/api_secret (required for live mode)".into(),
            });
        }
        if self.notification.enabled
            && (self.notification.telegram_token.is_none() || self.notification.chat_id.is_none())
        {
            errors.push(ValidationError::MissingField {
                field: "trading.notification.telegram_token/chat_id".into(),
            });
        }

        for result in [
            self.schedule.validate(),
            self.risk.validate(),
            self.sizing.validate(),
            self.invalidation.validate(),
        ] {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        for (id, overrides) in &self.strategies {
            if let Err(e) = validate_strategy(id, overrides) {
                errors.push(e);
            }
        }

        collect(errors)
    }
}

impl Validate for ScheduleConfig {
    fn validate(&self) -> ValidationResult<()> {
        if let Err(e) = cron::Schedule::from_str(&self.weekend_cron) {
            return Err(invalid("trading.schedule.weekend_cron", e.to_string()));
        }
        for (field, value) in [
            ("trading.schedule.market_open", &self.market_open),
            ("trading.schedule.market_close", &self.market_close),
            ("trading.schedule.daily_summary_time", &self.daily_summary_time),
        ] {
            if parse_hhmm(value).is_none() {
                return Err(invalid(field, format!("'{}' is not HH:MM", value)));
            }
        }
        if self.market_open_time() >= self.market_close_time() {
            return Err(invalid("trading.schedule.market_open", "must be before market_close"));
        }
        if self.market_interval_secs == 0 {
            return Err(invalid("trading.schedule.market_interval_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

impl Validate for RiskConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_positions == 0 {
            return Err(invalid("trading.risk.max_positions", "must be greater than 0"));
        }
        if !(self.max_position_pct > 0.0 && self.max_position_pct <= 1.0) {
            return Err(invalid("trading.risk.max_position_pct", "must be in (0, 1]"));
        }
        if self.min_notional < 0.0 {
            return Err(invalid("trading.risk.min_notional", "must not be negative"));
        }
        Ok(())
    }
}

impl Validate for SizingConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.score_multipliers.iter().any(|m| !(0.0..=1.0).contains(m)) {
            return Err(invalid("trading.sizing.score_multipliers", "each must be in [0, 1]"));
        }
        Ok(())
    }
}

impl Validate for InvalidationConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_loss_pct >= 0.0 {
            return Err(invalid("trading.invalidation.max_loss_pct", "must be negative"));
        }
        if self.trailing_stop_pct <= 0.0 {
            return Err(invalid("trading.invalidation.trailing_stop_pct", "must be positive"));
        }
        if self.max_hold_days <= 0 {
            return Err(invalid("trading.invalidation.max_hold_days", "must be positive"));
        }
        Ok(())
    }
}

fn validate_strategy(id: &str, o: &StrategyOverride) -> ValidationResult<()> {
    let field = |name: &str| format!("trading.strategies.{}.{}", id, name);

    if let Some(t) = &o.check_time {
        if parse_hhmm(t).is_none() {
            return Err(invalid(field("check_time"), format!("'{}' is not HH:MM", t)));
        }
    }
    if let Some(pct) = o.position_pct {
        if !(pct > 0.0 && pct <= 1.0) {
            return Err(invalid(field("position_pct"), "must be in (0, 1]"));
        }
    }
    if o.max_positions == Some(0) {
        return Err(invalid(field("max_positions"), "must be greater than 0"));
    }
    if let Some(weights) = &o.weights {
        if let Some((name, _)) = weights.iter().find(|(_, w)| **w < 0.0 || !w.is_finite()) {
            return Err(invalid(field("weights"), format!("weight '{}' must be >= 0", name)));
        }
    }
    Ok(())
}
