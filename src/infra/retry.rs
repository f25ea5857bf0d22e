//! Jittered exponential backoff for the on-chain write path.
//!
//! The scanner never retries in place (it narrows its block step instead),
//! so this module is only wired into transaction submission, where a
//! transient transport blip should not burn a whole executor iteration.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = only the initial attempt)
    pub max_retries: u32,
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Jitter factor in [0, 1]; the delay varies by +/- this fraction
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Preset for transaction submission.
    pub fn submission() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Delay for a 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Run `operation`, retrying while `should_retry` approves the error, up to
/// `config.max_retries` extra attempts.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    config: &RetryConfig,
    context: &str,
    operation: F,
    should_retry: P,
) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts > config.max_retries || !should_retry(&e) {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempts - 1);
                tracing::warn!(
                    context = context,
                    attempt = attempts,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
