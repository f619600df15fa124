//! Outbound request throttling.
//!
//! Two shapes are needed: a token bucket for chatty read APIs (quotes,
//! calendars) and fixed minimum spacing per endpoint for the broker, whose
//! limits are published per endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// A token bucket rate limiter.
///
/// Holds up to one second's worth of requests and refills continuously.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, requests_per_minute: u32) -> Self {
        let refill_per_sec = f64::from(requests_per_minute.max(1)) / 60.0;
        let capacity = refill_per_sec.ceil().max(1.0);
        Self {
            name: name.into(),
            capacity,
            refill_per_sec,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };
            debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "Rate limited, waiting for token");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

/// Shared rate limiter.
pub type SharedRateLimiter = Arc<RateLimiter>;

// ============================================================================
// Per-endpoint spacing
// ============================================================================

/// Enforces a minimum interval between consecutive calls to each endpoint.
#[derive(Debug)]
pub struct EndpointSpacing {
    intervals: HashMap<&'static str, Duration>,
    default_interval: Duration,
    last_call: Mutex<HashMap<&'static str, Instant>>,
}

impl EndpointSpacing {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            intervals: HashMap::new(),
            default_interval,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// Set the interval for one endpoint.
    pub fn with_interval(mut self, endpoint: &'static str, interval: Duration) -> Self {
        self.intervals.insert(endpoint, interval);
        self
    }

    pub fn interval(&self, endpoint: &str) -> Duration {
        self.intervals
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Sleep until `endpoint` may be called again, then record the call.
    ///
    /// The lock is held across the sleep so concurrent callers queue up.
    pub async fn wait(&self, endpoint: &'static str) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = last.get(endpoint) {
            let min = self.interval(endpoint);
            let elapsed = prev.elapsed();
            if elapsed < min {
                let remaining = min - elapsed;
                debug!(endpoint, wait_ms = remaining.as_millis() as u64, "Spacing broker call");
                tokio::time::sleep(remaining).await;
            }
        }
        last.insert(endpoint, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_exhausts() {
        let limiter = RateLimiter::new("test", 60); // 1 req/sec
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_refills() {
        let limiter = RateLimiter::new("test", 6000); // 100 req/sec
        while limiter.try_acquire().await {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.try_acquire().await);
    }

    #[test]
    fn test_endpoint_intervals() {
        let spacing = EndpointSpacing::new(Duration::from_secs(2))
            .with_interval("account", Duration::from_secs(6));
        assert_eq!(spacing.interval("account"), Duration::from_secs(6));
        assert_eq!(spacing.interval("positions"), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_spacing_delays_second_call() {
        let spacing = EndpointSpacing::new(Duration::from_millis(80));
        let start = Instant::now();
        spacing.wait("orders").await;
        spacing.wait("orders").await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_spacing_is_per_endpoint() {
        let spacing = EndpointSpacing::new(Duration::from_secs(5));
        let start = Instant::now();
        spacing.wait("orders").await;
        spacing.wait("positions").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
