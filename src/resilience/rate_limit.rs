// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limit window tracking from `X-RateLimit-*` response headers.
//!
//! Writes take a mutex; the values are mirrored into atomics so threshold
//! checks on the request path never block. Within one window (same reset
//! timestamp) `remaining` only goes down: responses that arrive out of order
//! from concurrent workers cannot raise it again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

const UNKNOWN: u64 = u64::MAX;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Last known quota window. `reset` is a unix timestamp in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<u64>,
}

impl RateLimitState {
    #[must_use]
    pub fn remaining_ratio(&self) -> Option<f64> {
        match (self.limit, self.remaining) {
            (Some(limit), Some(remaining)) if limit > 0 => Some(remaining as f64 / limit as f64),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitTracker {
    state: Mutex<RateLimitState>,
    limit_hint: AtomicU64,
    remaining_hint: AtomicU64,
    reset_hint: AtomicU64,
    warn_ratio: f64,
    critical_ratio: f64,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(0.2, 0.05)
    }
}

impl RateLimitTracker {
    #[must_use]
    pub fn new(warn_ratio: f64, critical_ratio: f64) -> Self {
        Self {
            state: Mutex::new(RateLimitState::default()),
            limit_hint: AtomicU64::new(UNKNOWN),
            remaining_hint: AtomicU64::new(UNKNOWN),
            reset_hint: AtomicU64::new(UNKNOWN),
            warn_ratio,
            critical_ratio,
        }
    }

    /// Fold one response's headers (lower-cased names) into the window state.
    /// Missing or unparsable values leave the previous value in place.
    pub fn observe(&self, headers: &HashMap<String, String>) {
        let parse = |name: &str| headers.get(name).and_then(|v| v.trim().parse::<u64>().ok());
        let limit = parse(HEADER_LIMIT);
        let remaining = parse(HEADER_REMAINING);
        let reset = parse(HEADER_RESET);

        if limit.is_none() && remaining.is_none() && reset.is_none() {
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            let same_window = match (reset, state.reset) {
                (Some(new), Some(old)) => new == old,
                (None, _) => true,
                (Some(_), None) => false,
            };

            if let Some(limit) = limit {
                state.limit = Some(limit);
            }
            if let Some(remaining) = remaining {
                state.remaining = match state.remaining {
                    Some(current) if same_window => Some(current.min(remaining)),
                    _ => Some(remaining),
                };
            }
            if let Some(reset) = reset {
                state.reset = Some(reset);
            }

            self.limit_hint.store(state.limit.unwrap_or(UNKNOWN), Ordering::Release);
            self.remaining_hint.store(state.remaining.unwrap_or(UNKNOWN), Ordering::Release);
            self.reset_hint.store(state.reset.unwrap_or(UNKNOWN), Ordering::Release);
            *state
        };

        if let Some(remaining) = snapshot.remaining {
            crate::metrics::set_rate_limit_remaining(remaining);
        }
        if let Some(ratio) = snapshot.remaining_ratio() {
            if ratio < self.warn_ratio {
                warn!(
                    remaining = snapshot.remaining.unwrap_or_default(),
                    limit = snapshot.limit.unwrap_or_default(),
                    reset = snapshot.reset.unwrap_or_default(),
                    "Approaching rate limit"
                );
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> RateLimitState {
        *self.state.lock()
    }

    /// Lock-free view of the current window.
    #[must_use]
    pub fn hint(&self) -> RateLimitState {
        let load = |a: &AtomicU64| match a.load(Ordering::Acquire) {
            UNKNOWN => None,
            v => Some(v),
        };
        RateLimitState {
            limit: load(&self.limit_hint),
            remaining: load(&self.remaining_hint),
            reset: load(&self.reset_hint),
        }
    }

    /// How long to hold off before the next request, if the window is nearly
    /// spent and its reset is still ahead of `now_unix`.
    #[must_use]
    pub fn throttle_delay(&self, now_unix: u64, cap: Duration) -> Option<Duration> {
        let hint = self.hint();
        let ratio = hint.remaining_ratio()?;
        if ratio >= self.critical_ratio {
            return None;
        }
        let reset = hint.reset?;
        if reset <= now_unix {
            return None;
        }
        Some(Duration::from_secs(reset - now_unix).min(cap))
    }

    /// [`throttle_delay`](Self::throttle_delay) against the system clock.
    #[must_use]
    pub fn throttle_delay_now(&self, cap: Duration) -> Option<Duration> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
        self.throttle_delay(now, cap)
    }
}

/// Parse a `Retry-After` header given in whole seconds. HTTP-date values are
/// ignored and fall back to the backoff formula.
#[must_use]
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .get(HEADER_RETRY_AFTER)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
