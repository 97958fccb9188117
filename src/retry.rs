//! Bounded retries with exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first. Generation units and sort tasks share it.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No backoff at all; used by tests that inject failures.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// `config.max_attempts` attempts have been made.
///
/// The operation receives the 1-based attempt number so it can keep per-attempt
/// resources apart.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub fn retry_with_backoff<T, E, F, R>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) || attempt >= max_attempts {
                    return Err(err);
                }
                let delay = config.delay_for(attempt);
                warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, retrying");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
        assert_eq!(config.delay_for(30), Duration::from_millis(5000));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let config = RetryConfig::immediate(3);
        let mut seen = Vec::new();
        let result: Result<u32, String> = retry_with_backoff(
            &config,
            |attempt| {
                seen.push(attempt);
                if attempt < 3 { Err("flaky".into()) } else { Ok(attempt) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(3));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn stops_at_max_attempts() {
        let config = RetryConfig::immediate(2);
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(
            &config,
            |_| {
                calls += 1;
                Err("down".into())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn non_retryable_errors_return_immediately() {
        let config = RetryConfig::immediate(5);
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(
            &config,
            |_| {
                calls += 1;
                Err("fatal".into())
            },
            |e| e != "fatal",
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
