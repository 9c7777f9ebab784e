//! Retry policy shared by every call that crosses a network boundary.
//!
//! A policy bounds the number of attempts and decides how long to wait
//! between them. Two shapes are supported: a constant (linear) delay used
//! for the very first broker connection, and an exponential delay with
//! symmetric jitter used after an established connection was lost.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::warn;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Same delay before every retry.
    Linear,
    /// Delay doubles after every failed attempt, up to the cap.
    Exponential,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.2 means ±20%).
    pub jitter: f64,
    /// Growth shape.
    pub kind: BackoffKind,
}

/// The last error seen once a policy ran out of attempts.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    /// Constant delay between attempts, no jitter.
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
            kind: BackoffKind::Linear,
        }
    }

    /// Doubling delay starting at `base`, capped at `cap`, with `jitter`.
    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: base,
            max_delay: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            kind: BackoffKind::Exponential,
        }
    }

    /// Budget for the first connection to the broker: 10 attempts, 5s apart.
    pub fn initial_connect() -> Self {
        Self::linear(10, Duration::from_secs(5))
    }

    /// Budget for re-establishing a lost connection: 1s doubling to 30s, ±20%.
    pub fn reconnect() -> Self {
        Self::exponential(10, Duration::from_secs(1), Duration::from_secs(30), 0.2)
    }

    /// A single attempt with no waiting.
    pub fn no_retry() -> Self {
        Self::linear(1, Duration::ZERO)
    }

    /// Nominal delay after the given failed attempt (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Linear => self.base_delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << exponent;
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Delay after the given failed attempt with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let nominal = self.delay_for(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor)
    }

    /// Runs `op` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}
