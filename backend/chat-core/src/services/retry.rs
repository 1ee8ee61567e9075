//! Retry policy with exponential backoff and jitter

use crate::error::AppResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or retries run out.
///
/// Only errors reporting `is_retryable()` are retried; the last error is
/// returned unchanged.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    warn!(
                        operation,
                        error = %e,
                        "Max retries ({}) reached",
                        config.max_retries
                    );
                    return Err(e);
                }

                let delay = calculate_backoff(backoff, config.jitter);

                warn!(
                    operation,
                    error = %e,
                    "Retry attempt {}/{}, waiting {:?}",
                    attempt,
                    config.max_retries,
                    delay
                );

                tokio::time::sleep(delay).await;

                backoff = next_backoff(backoff, config);
            }
        }
    }
}

/// Grow `current` by the multiplier, capped at `max_backoff`
pub(crate) fn next_backoff(current: Duration, config: &RetryConfig) -> Duration {
    Duration::from_millis(
        ((current.as_millis() as f64 * config.backoff_multiplier)
            .min(config.max_backoff.as_millis() as f64)) as u64,
    )
}

pub(crate) fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
