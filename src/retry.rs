//! Retry with exponential backoff.
//!
//! - Exponential backoff: `delay = initial_delay_ms * multiplier^(attempt-1)`
//! - Clamped to `max_delay_ms`
//! - Deterministic jitter: `+ (attempt * 7919 + 104729) % (base/4 + 1)`
//! - Errors the caller does not consider retryable short-circuit immediately

use crate::error::{Result, ShareError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry-with-backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Upper bound for computed delay (milliseconds).
    pub max_delay_ms: u64,
    /// Multiplicative factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add deterministic jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A configuration that never sleeps, for tests and in-process stores
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ShareError::config("retry max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ShareError::config("retry backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

/// Compute the delay in milliseconds for a given attempt (1-indexed).
///
/// The result never exceeds `max_delay_ms`, including jitter.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let multiplier_power = config.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
    let base_f64 = (config.initial_delay_ms as f64) * multiplier_power;

    // Handles NaN, Inf, and negative values.
    let max = config.max_delay_ms as f64;
    let clamped = if base_f64.is_nan() || base_f64 < 0.0 {
        0.0
    } else if base_f64 > max {
        max
    } else {
        base_f64
    };

    let mut delay = (clamped as u64).min(config.max_delay_ms);

    if config.jitter && delay > 0 {
        let quarter = delay / 4;
        if quarter > 0 {
            let attempt_u64 = attempt as u64;
            let jitter_val = (attempt_u64.wrapping_mul(7919).wrapping_add(104729)) % (quarter + 1);
            delay = delay.saturating_add(jitter_val).min(config.max_delay_ms);
        }
    }

    delay
}

/// Runs `operation` until it succeeds, the error is not retryable, or the
/// attempt budget is spent. The last error is returned on exhaustion.
///
/// `operation` receives the 1-indexed attempt number.
pub fn retry_with_backoff<T, F, P>(config: &RetryConfig, should_retry: P, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
    P: Fn(&ShareError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if !should_retry(&e) || attempt >= max_attempts {
                    return Err(e);
                }

                let delay_ms = compute_delay(config, attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms,
                    error = %e,
                    "Retrying after backoff"
                );
                if delay_ms > 0 {
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
            }
        }
    }
}
