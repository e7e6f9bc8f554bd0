//! Retry strategies for operations against the server.
//!
//! The device never gives up on reconnecting: the default [`BackOff`] grows
//! the delay exponentially from one second and caps it at five minutes.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

/// How the next delay is derived from the previous one.
pub type DelayEvolution = fn(Duration) -> Duration;

/// Retries an operation until it succeeds or fails unexpectedly.
///
/// `is_expected` classifies errors: expected errors are retried according to
/// the strategy, anything else propagates immediately.
#[allow(async_fn_in_trait)]
pub trait RetryStrategy {
    async fn execute<T, E, F, Fut, P>(&self, operation: F, is_expected: P) -> Result<T, E>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        P: Fn(&E) -> bool + Send,
        E: std::fmt::Display;
}

/// Executes the operation once and propagates any failure.
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    async fn execute<T, E, F, Fut, P>(&self, operation: F, _is_expected: P) -> Result<T, E>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        P: Fn(&E) -> bool + Send,
        E: std::fmt::Display,
    {
        operation().await
    }
}

/// Retries expected failures with a growing delay, forever.
pub struct BackOff {
    initial: Duration,
    max_backoff: Duration,
    next_delay: DelayEvolution,
}

fn double(previous: Duration) -> Duration {
    previous * 2
}

impl BackOff {
    pub fn new(initial: Duration, max_backoff: Duration) -> Self {
        BackOff {
            initial,
            max_backoff,
            next_delay: double,
        }
    }

    /// Use a custom delay evolution instead of doubling.
    pub fn with_evolution(
        initial: Duration,
        max_backoff: Duration,
        next_delay: DelayEvolution,
    ) -> Self {
        BackOff {
            initial,
            max_backoff,
            next_delay,
        }
    }
}

impl Default for BackOff {
    /// Exponential doubling from one second, capped at five minutes.
    fn default() -> Self {
        BackOff::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RetryStrategy for BackOff {
    async fn execute<T, E, F, Fut, P>(&self, operation: F, is_expected: P) -> Result<T, E>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        P: Fn(&E) -> bool + Send,
        E: std::fmt::Display,
    {
        let mut delay = self.initial;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if is_expected(&err) => {
                    info!(error = %err, delay_secs = delay.as_secs_f64(), "retrying after failure");
                }
                Err(err) => return Err(err),
            }
            sleep(delay).await;
            delay = (self.next_delay)(delay).min(self.max_backoff);
        }
    }
}
