//! Bounded exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;

/// Fraction of the base delay used as the jitter window (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Retry configuration for a fetch or mutate call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay (pre-jitter).
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a config with the given attempt budget and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A config that never retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Pre-jitter delay before attempt `attempt + 1`, where `attempt` is the
    /// 1-indexed attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let millis = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(exp as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Apply ±25% uniform jitter to a delay, flooring to whole milliseconds.
///
/// Spreads retry timing across concurrent callers so a shared upstream
/// failure does not produce a synchronized retry storm.
pub fn jittered(delay: Duration) -> Duration {
    let base = delay.as_millis() as f64;
    let jitter = base * JITTER_FACTOR * rand::thread_rng().gen_range(-1.0..=1.0);
    Duration::from_millis((base + jitter).floor().max(0.0) as u64)
}

/// Run `f` with bounded retries.
///
/// Attempt 1 runs immediately. Non-retryable errors (per
/// [`FetchError::is_retryable`]) return at once; retryable errors wait a
/// jittered backoff delay and try again, until `max_attempts` is exhausted,
/// at which point the last error is returned.
pub async fn execute<T, F, Fut>(config: &RetryConfig, f: F) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    execute_with_observer(config, f, |_, _, _| {}).await
}

/// Like [`execute`], with an observer invoked before each retry wait.
///
/// `on_retry(attempt, error, delay)` receives the 1-indexed attempt that
/// failed, the error, and the jittered delay about to be slept. It is
/// observability only and cannot alter control flow.
pub async fn execute_with_observer<T, F, Fut, O>(
    config: &RetryConfig,
    f: F,
    on_retry: O,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    O: Fn(u32, &FetchError, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt >= max_attempts => {
                return Err(err);
            }
            Err(err) => {
                let delay = jittered(config.delay_for_attempt(attempt));
                on_retry(attempt, &err, delay);
                tracing::warn!(
                    attempt,
                    kind = err.kind(),
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
