//! Per-route retry and timeout policies

use std::time::Duration;

/// Retry policy for failed upstream attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// HTTP status codes that trigger a retry
    pub retryable_status_codes: Vec<u16>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retryable_status_codes: vec![502, 503, 504], // Bad Gateway, Service Unavailable, Gateway Timeout
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Check if a status code should trigger a retry
    pub fn should_retry(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Total attempts allowed, initial one included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }
}

/// Complete policy attached to a route
#[derive(Clone, Debug, PartialEq)]
pub struct RoutePolicy {
    /// Upper bound for a single upstream attempt
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
