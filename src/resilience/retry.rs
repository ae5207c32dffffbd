// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with jittered exponential backoff.
//!
//! The delay before retry `n` (zero-based) is `base_delay * 2^n`, scaled by a
//! uniform factor in `[0.5, 1.5]` and capped at `max_delay`. An error that
//! carries a server-requested wait (`Retry-After`) is retried after exactly
//! that wait instead. The first attempt is never delayed.
//!
//! # Example
//!
//! ```
//! use ctrld_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let api = RetryConfig::api();
//! assert_eq!(api.max_attempts, 10);
//!
//! // Third retry, no jitter: 1s * 2^2
//! assert_eq!(api.backoff_delay(2, 1.0), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Lower and upper bound of the jitter factor.
pub const JITTER_RANGE: (f64, f64) = (0.5, 1.5);

/// Retry behaviour for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a proactive wait on a nearly exhausted rate-limit window.
    pub max_throttle_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::api()
    }
}

impl RetryConfig {
    /// Settings for the REST API: 10 attempts, 1s base, 60s cap.
    #[must_use]
    pub fn api() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_throttle_wait: Duration::from_secs(60),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_throttle_wait: Duration::from_millis(10),
        }
    }

    /// Delay before retry number `retry` (zero-based) for a given jitter factor.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_RANGE.0, JITTER_RANGE.1);
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(retry.min(1_000) as i32) * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Bounds `[low, high]` the jittered delay for `retry` must fall into.
    #[must_use]
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        (self.backoff_delay(retry, JITTER_RANGE.0), self.backoff_delay(retry, JITTER_RANGE.1))
    }
}

/// Uniform jitter factor in `[0.5, 1.5]`.
#[must_use]
pub fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1)
}

/// Error classification consumed by [`retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Exact wait requested by the server, overriding the backoff formula.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for crate::error::ApiError {
    fn is_retryable(&self) -> bool {
        crate::error::ApiError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        crate::error::ApiError::retry_after(self)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. The closure receives the zero-based attempt.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(val) => {
                if attempt > 0 {
                    info!(operation = operation_name, retries = attempt, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                let next = attempt + 1;
                if !err.is_retryable() || next >= config.max_attempts {
                    return Err(err);
                }

                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| config.backoff_delay(attempt, jitter_factor()));

                warn!(
                    operation = operation_name,
                    attempt = next,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %crate::sanitize::sanitize_for_log(&err.to_string()),
                    "Operation failed, retrying"
                );
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
                attempt = next;
            }
        }
    }
}
