//! Error taxonomy for the decision engine.
//!
//! Each variant maps to one handling policy:
//!
//! | Variant           | Policy                                              |
//! |-------------------|-----------------------------------------------------|
//! | `DataUnavailable` | skip the candidate, not fatal                       |
//! | `BrokerRejected`  | drop the signal, notify, no retry this cycle        |
//! | `Configuration`   | fatal at start-up                                   |
//! | `RateLimited`     | bounded backoff and retry                           |
//! | `Upstream`        | bounded backoff and retry, symbol stays usable      |
//! | `Validation`      | discard the input at source                         |
//! | `Broker`          | fail the current cycle, retried next tick           |

use thiserror::Error;

/// Result alias for engine operations.
pub type TradingResult<T> = std::result::Result<T, TradingError>;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Market data missing for a symbol
    #[error("data unavailable for {symbol}: {what}")]
    DataUnavailable { symbol: String, what: String },

    /// Broker refused an order
    #[error("broker rejected order for {symbol}: {reason}")]
    BrokerRejected { symbol: String, reason: String },

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Endpoint throttled us
    #[error("rate limited on {endpoint} (retry after {retry_after_secs}s)")]
    RateLimited {
        endpoint: String,
        retry_after_secs: u64,
    },

    /// Data endpoint answered with a transient failure status
    #[error("upstream {endpoint} returned HTTP {status}")]
    Upstream { endpoint: String, status: u16 },

    /// Malformed input discarded at source
    #[error("validation failed: {0}")]
    Validation(String),

    /// Broker unreachable or returned an unexpected response
    #[error("broker unavailable: {0}")]
    Broker(String),

    /// Authentication refused by a remote API
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Transport-level HTTP failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TradingError {
    pub fn data_unavailable(symbol: impl Into<String>, what: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            what: what.into(),
        }
    }

    pub fn rejected(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BrokerRejected {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn upstream(endpoint: impl Into<String>, status: u16) -> Self {
        Self::Upstream {
            endpoint: endpoint.into(),
            status,
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Upstream { .. } | Self::Broker(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error()),
            _ => false,
        }
    }

    /// Whether the failure should abort the whole cycle rather than one unit of work.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, Self::Broker(_) | Self::Auth(_) | Self::Http(_))
    }
}

impl From<edge_common::ValidationError> for TradingError {
    fn from(e: edge_common::ValidationError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let limited = TradingError::RateLimited {
            endpoint: "orders".into(),
            retry_after_secs: 60,
        };
        assert!(limited.is_recoverable());
        assert!(TradingError::Broker("timeout".into()).is_recoverable());
        assert!(!TradingError::rejected("AAPL", "insufficient funds").is_recoverable());
        assert!(!TradingError::Auth("401".into()).is_recoverable());
        assert!(TradingError::upstream("yahoo", 503).is_recoverable());
        assert!(!TradingError::upstream("yahoo", 503).is_cycle_fatal());
    }

    #[test]
    fn test_cycle_fatal() {
        assert!(TradingError::Broker("down".into()).is_cycle_fatal());
        assert!(!TradingError::data_unavailable("MSFT", "history").is_cycle_fatal());
    }

    #[test]
    fn test_display() {
        let e = TradingError::data_unavailable("AAPL", "2y history");
        assert_eq!(e.to_string(), "data unavailable for AAPL: 2y history");
    }

    #[test]
    fn test_validation_error_becomes_configuration() {
        let v = edge_common::ValidationError::MissingField {
            field: "trading.broker.api_key".into(),
        };
        let e: TradingError = v.into();
        assert!(matches!(e, TradingError::Configuration(_)));
    }
}
