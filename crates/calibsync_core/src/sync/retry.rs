//! Bounded exponential backoff for retryable source failures.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Retry budget and delay curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            factor: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be >= 1".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("retry.factor must be >= 1.0, got {}", self.factor));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Delay to wait after the `failed_attempts`-th consecutive failure.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failed_attempts - 1).unwrap_or(i32::MAX);
        let millis = (self.initial_delay_ms as f64) * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// Non-retryable errors are returned after a single attempt.
pub fn retry<T, E, F, R>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation() {
            Ok(value) => {
                if attempts > 1 {
                    info!(
                        "event=retry module=sync status=recovered operation={operation_name} attempts={attempts}"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) || attempts >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts,
                        last_error: err,
                    });
                }
                let delay = policy.delay_for(attempts);
                warn!(
                    "event=retry module=sync status=retrying operation={operation_name} attempt={attempts} max_attempts={} delay_ms={} error={err}",
                    policy.max_attempts,
                    delay.as_millis()
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
