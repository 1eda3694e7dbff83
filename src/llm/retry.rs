use crate::error::{FinancialReportError, Result};
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Capped exponential backoff for retryable upstream failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Adds up to 25% random delay to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based), before jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    fn wait_after(&self, attempt: u32, error: &FinancialReportError) -> Duration {
        let backoff = self.backoff_for(attempt);
        let base = match error {
            FinancialReportError::UpstreamRateLimit {
                retry_after: Some(retry_after),
            } => (*retry_after).max(backoff).min(self.max_backoff),
            _ => backoff,
        };
        if self.jitter {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }
}

/// Outcome of a retried call, including what it cost.
#[derive(Debug)]
pub struct RetryReport<T> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub result: Result<T>,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Each attempt is bounded by `attempt_timeout`.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    label: &str,
    mut operation: F,
) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout(attempt_timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(FinancialReportError::UpstreamTimeout(attempt_timeout)),
        };

        match result {
            Ok(value) => {
                debug!("{} succeeded on attempt {}", label, attempt);
                return RetryReport {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    result: Ok(value),
                };
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let wait = policy.wait_after(attempt, &e);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    label, attempt, max_attempts, e, wait
                );
                sleep(wait).await;
            }
            Err(e) => {
                warn!("{} failed after {} attempt(s): {}", label, attempt, e);
                return RetryReport {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    result: Err(e),
                };
            }
        }
    }
}
