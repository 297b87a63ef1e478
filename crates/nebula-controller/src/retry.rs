//! Retry policies.
//!
//! Two distinct loops live here. [`retry_with_backoff`] wraps outbound
//! scheduler calls: bounded attempts, exponential backoff with jitter, and
//! a predicate deciding which errors are worth another attempt.
//! [`retry_on_conflict`] wraps fetch-compare-write cycles against the
//! desired-state store and only repeats on [`StoreError::Conflict`]; it
//! stops early once its cancellation token fires.

use std::future::Future;
use std::time::Duration;

use nebula_meta::StoreError;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff for scheduler RPCs.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Single attempt, never sleeps.
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Run `operation` until it succeeds, returns an error `should_retry` rejects,
/// or `config.max_attempts` is used up. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }

                let sleep_for = config.jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis() as u64,
                    "scheduler call failed, retrying"
                );
                tokio::time::sleep(sleep_for).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Bounded retry for optimistic-concurrency conflicts.
///
/// Defaults mirror the usual controller setting: 5 steps, 10ms apart,
/// 10% jitter, no growth.
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    pub steps: u32,
    pub delay: Duration,
    pub factor: f64,
    /// Fraction of `delay` added at random, 0.0 disables.
    pub jitter: f64,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            steps: 5,
            delay: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
        }
    }
}

impl ConflictRetry {
    pub fn with_steps(steps: u32) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    fn sleep_for(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + extra))
    }
}

/// Run a fetch-compare-write closure, repeating it while it reports a
/// conflict. Any other error, or the conflict left after the final step or
/// after `cancel` fired, is returned to the caller.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &ConflictRetry,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let steps = policy.steps.max(1);
    let mut delay = policy.delay;

    let mut step = 1u32;

    loop {
        match attempt().await {
            Err(e) if e.is_conflict() && step < steps && !cancel.is_cancelled() => {
                debug!(step, error = %e, "write conflict, re-fetching");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(policy.sleep_for(delay)) => {}
                }
                delay = Duration::from_secs_f64(delay.as_secs_f64() * policy.factor.max(1.0));
                step += 1;
            }
            other => return other,
        }
    }
}
