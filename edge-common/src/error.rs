//! Error types shared by Edge crates.

use thiserror::Error;

/// Result type alias using the common error.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external service failed
    #[error("External service error: {service}: {message}")]
    External { service: String, message: String },

    /// Internal invariant broken
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error with extra context attached
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with a context message.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error is fatal at start-up.
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(e: crate::validation::ValidationError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Extension trait to attach context to results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_context_display() {
        let err = Error::NotFound("AAPL".into()).with_context("loading position");
        assert_eq!(err.to_string(), "loading position: Not found: AAPL");
    }

    #[test]
    fn test_is_config() {
        assert!(Error::Config("bad".into()).is_config());
        assert!(!Error::Internal("x".into()).is_config());
    }

    #[test]
    fn test_validation_error_is_config() {
        let err: Error = crate::validation::ValidationError::MissingField {
            field: "trading.broker.api_key".into(),
        }
        .into();
        assert!(err.is_config());
    }

    #[test]
    fn test_result_ext() {
        let r: Result<()> = Err(Error::InvalidInput("qty".into()));
        let msg = r.context("placing order").unwrap_err().to_string();
        assert!(msg.starts_with("placing order"));
    }
}
