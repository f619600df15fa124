//! Bounded retry for market data and calendar requests.
//!
//! 429, 5xx and transport failures are retried with a linear backoff; any
//! other status is handed back to the caller to classify.

use std::time::Duration;
use tracing::{debug, warn};

use super::rate_limiter::RateLimiter;
use crate::error::{TradingError, TradingResult};

/// Attempt count and base delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_millis(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, Duration::from_millis(delay_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Send the request built by `build` until it returns a non-transient
    /// status or the attempts run out.
    pub async fn send<F>(&self, endpoint: &str, limiter: &RateLimiter, build: F) -> TradingResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = TradingError::upstream(endpoint, 0);

        for attempt in 1..=self.max_attempts {
            limiter.acquire().await;
            debug!(endpoint, attempt, "Upstream request");

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        warn!(endpoint, attempt, "Rate limited, backing off");
                        last_error = TradingError::RateLimited {
                            endpoint: endpoint.to_string(),
                            retry_after_secs: self.backoff(attempt).as_secs(),
                        };
                    } else if status.is_server_error() {
                        warn!(endpoint, attempt, status = status.as_u16(), "Upstream server error");
                        last_error = TradingError::upstream(endpoint, status.as_u16());
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    let e = TradingError::from(e);
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(endpoint, attempt, error = %e, "Upstream request failed");
                    last_error = e;
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        Err(last_error)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.delay * attempt
    }
}
