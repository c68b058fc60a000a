//! Retry Logic for Guest Agent Calls
//!
//! Exponential backoff with jitter around a single agent call. Only errors whose
//! classification is retryable (transport and connectivity failures) are retried;
//! security, availability, authorization and not-found errors fail immediately.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vmshell_gateway::exec::RetryConfig;
//!
//! let config = RetryConfig::new()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2));
//! assert_eq!(config.max_attempts, 5);
//! ```

use std::time::Duration;
use tokio::time::sleep;

use crate::error::GatewayResult;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0) applied to each delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, never retried
    pub fn no_retry() -> Self {
        Self::default().max_attempts(1)
    }

    /// Set the maximum number of attempts; zero is treated as one
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    ///
    /// `base_delay * 2^attempt`, plus up to `jitter` of random variation, capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt));

        let jitter_range = exponential_delay.min(self.max_delay).mul_f64(self.jitter);
        let jitter_offset = rand::random::<f64>() * jitter_range.as_secs_f64();
        let jittered_delay = exponential_delay.saturating_add(Duration::from_secs_f64(jitter_offset));

        jittered_delay.min(self.max_delay)
    }
}

/// Retry an agent call with exponential backoff
///
/// Returns the first success, the first non-retryable error, or the last error once
/// `max_attempts` is used up.
pub async fn retry_with_backoff<F, T, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = GatewayResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} succeeded on attempt {} after {} retries",
                        operation_name,
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt + 1 < max_attempts && e.is_retryable() {
                    let delay = config.calculate_delay(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation_name,
                        attempt + 1,
                        max_attempts,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                } else {
                    tracing::debug!("{} failed after {} attempts: {}", operation_name, attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Check if an HTTP status from the Proxmox API is worth retrying
///
/// 408, 429 and 5xx (except 501 and 505) are transient; every other status is not.
pub fn should_retry_status(status: u16) -> bool {
    match status {
        408 | 429 => true,
        500..=599 => status != 501 && status != 505,
        _ => false,
    }
}
