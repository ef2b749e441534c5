// Retry strategy implementation with exponential backoff and jitter
// Used while the service waits for the database to become reachable at startup.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt.
    /// Returns None once the attempt budget is spent.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total attempts allowed, including the first one
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry strategy with jitter
/// Sequence: 500ms, 1s, 2s, 4s, ... capped at `max_delay_ms`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// 0.0 to 1.0
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Same delays, different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Calculate exponential delay without jitter: base * 2^attempt, capped
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }
        base_delay_ms + rand::thread_rng().gen_range(0..=jitter_range_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        Some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error,
/// or the strategy runs out of attempts. The last error is returned.
pub async fn retry_with<S, T, E, Op, Fut, P>(
    strategy: &S,
    is_retryable: P,
    mut operation: Op,
) -> Result<T, E>
where
    S: RetryStrategy + ?Sized,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => match strategy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = strategy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
