//! Bounded Status Polling
//!
//! After a command is submitted the coordinator polls `exec-status` until the guest
//! agent reports the process as exited. The loop is bounded three ways: attempt
//! count, an overall deadline and a cancellation token. Cancelling only ends the
//! local wait; the guest process keeps running.

use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::agent::ExecStatus;
use crate::error::{GatewayError, GatewayResult};

/// Polling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Wait before the first status query
    pub initial_delay: Duration,

    /// Wait between the first and second query
    pub interval: Duration,

    /// Growth factor applied to the interval after each query
    pub backoff_multiplier: f64,

    /// Upper bound for the interval
    pub max_interval: Duration,

    /// Maximum number of status queries
    pub max_attempts: u32,

    /// Overall deadline, measured from the start of polling
    pub timeout: Duration,

    /// Keep polling until the agent reports `exited`
    ///
    /// When false, the first status response is accepted as final and a
    /// still-running process is only logged.
    pub require_exit: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_interval: Duration::from_secs(5),
            max_attempts: 120,
            timeout: Duration::from_secs(300),
            require_exit: true,
        }
    }
}

impl PollConfig {
    /// Single query after the initial delay, accepting whatever it returns
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            require_exit: false,
            ..Self::default()
        }
    }

    /// Wait after query number `attempt` (1-indexed) before the next one
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let max_secs = self.max_interval.as_secs_f64();
        let secs = (self.interval.as_secs_f64() * factor).min(max_secs);
        Duration::from_secs_f64(secs)
    }
}

/// Final status of a successful poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status: ExecStatus,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Why polling stopped without an outcome
#[derive(Debug)]
pub enum PollFailure {
    /// Cancelled by the caller after `attempts` queries
    Cancelled { attempts: u32 },

    /// Attempts or deadline used up before the process exited
    Exhausted { attempts: u32, elapsed: Duration },

    /// A status query failed
    Agent(GatewayError),
}

impl PollFailure {
    /// Convert into a gateway error for the given operation
    pub fn into_error(self, operation: &str) -> GatewayError {
        match self {
            Self::Cancelled { attempts } => {
                GatewayError::cancelled(operation).with_context("attempts", attempts)
            }
            Self::Exhausted { attempts, elapsed } => GatewayError::timeout(elapsed, attempts, operation),
            Self::Agent(e) => e,
        }
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

/// Poll until the process exits, the bounds are hit, or the caller cancels
///
/// `query` receives the 1-indexed attempt number.
pub async fn poll_until_exited<F, Fut>(
    config: &PollConfig,
    cancel: &CancellationToken,
    mut query: F,
) -> Result<PollOutcome, PollFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<ExecStatus>>,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let max_attempts = config.max_attempts.max(1);

    if !sleep_or_cancel(config.initial_delay.min(config.timeout), cancel).await {
        return Err(PollFailure::Cancelled { attempts: 0 });
    }

    let mut attempt = 0;
    loop {
        attempt += 1;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollFailure::Cancelled { attempts: attempt - 1 }),
            result = time::timeout_at(deadline, query(attempt)) => match result {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => return Err(PollFailure::Agent(e)),
                Err(_) => {
                    return Err(PollFailure::Exhausted {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    })
                }
            },
        };

        if status.exited {
            return Ok(PollOutcome {
                status,
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        if !config.require_exit {
            tracing::warn!("Command may not have completed (exited flag not set after {} polls)", attempt);
            return Ok(PollOutcome {
                status,
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        let now = Instant::now();
        if attempt >= max_attempts || now >= deadline {
            return Err(PollFailure::Exhausted {
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        let wait = config.interval_for_attempt(attempt).min(deadline - now);
        tracing::debug!("Process still running after poll {}, next poll in {:?}", attempt, wait);

        if !sleep_or_cancel(wait, cancel).await {
            return Err(PollFailure::Cancelled { attempts: attempt });
        }
    }
}
