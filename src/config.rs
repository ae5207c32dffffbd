// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the reconciler.
//!
//! # Example
//!
//! ```
//! use ctrld_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.batch_size, 500);
//! assert_eq!(config.cooldown_secs, 60);
//!
//! // Tuned config
//! let config = SyncConfig {
//!     batch_workers: 2,
//!     cooldown_secs: 90,
//!     ..Default::default()
//! };
//! assert_eq!(config.execution_policy().workers, 2);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::batching::strategy::ExecutionPolicy;
use crate::resilience::retry::RetryConfig;

/// Configuration for a reconciliation run.
///
/// All fields have defaults matching the remote service's published limits.
/// Credentials are not part of this struct; they are handed to the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// REST base, profile ids are appended as the first path segment
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retry settings for API calls
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Rate-limit thresholds (fraction of the window's limit still available)
    #[serde(default = "default_rate_limit_warn_ratio")]
    pub rate_limit_warn_ratio: f64,
    #[serde(default = "default_rate_limit_critical_ratio")]
    pub rate_limit_critical_ratio: f64,
    #[serde(default = "default_max_throttle_wait_secs")]
    pub max_throttle_wait_secs: u64,

    /// Rule push settings
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,

    /// Stage concurrency
    #[serde(default = "default_delete_workers")]
    pub delete_workers: usize,
    #[serde(default = "default_collect_workers")]
    pub collect_workers: usize,
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    /// Pause after deletions before re-creating folders (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Visibility polling after folder creation
    #[serde(default = "default_folder_poll_attempts")]
    pub folder_poll_attempts: u32,
    #[serde(default = "default_folder_poll_delay_ms")]
    pub folder_poll_delay_ms: u64,

    /// Ceiling for a single blocklist download (bytes)
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Persisted definition cache. `None` uses the platform cache directory.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

fn default_api_base() -> String { "https://api.controld.com/profiles".to_string() }
fn default_user_agent() -> String { format!("ctrld-sync/{}", env!("CARGO_PKG_VERSION")) }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_attempts() -> u32 { 10 }
fn default_retry_base_ms() -> u64 { 1_000 }
fn default_retry_max_ms() -> u64 { 60_000 }
fn default_rate_limit_warn_ratio() -> f64 { 0.2 }
fn default_rate_limit_critical_ratio() -> f64 { 0.05 }
fn default_max_throttle_wait_secs() -> u64 { 60 }
fn default_batch_size() -> usize { 500 }
fn default_batch_workers() -> usize { 3 }
fn default_inline_threshold() -> usize { 500 }
fn default_delete_workers() -> usize { 3 }
fn default_collect_workers() -> usize { 5 }
fn default_fetch_workers() -> usize { 16 }
fn default_cooldown_secs() -> u64 { 60 }
fn default_heartbeat_secs() -> u64 { 10 }
fn default_folder_poll_attempts() -> u32 { 10 }
fn default_folder_poll_delay_ms() -> u64 { 5_000 }
fn default_max_response_bytes() -> usize { 10 * 1024 * 1024 } // 10 MB

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            rate_limit_warn_ratio: default_rate_limit_warn_ratio(),
            rate_limit_critical_ratio: default_rate_limit_critical_ratio(),
            max_throttle_wait_secs: default_max_throttle_wait_secs(),
            batch_size: default_batch_size(),
            batch_workers: default_batch_workers(),
            inline_threshold: default_inline_threshold(),
            delete_workers: default_delete_workers(),
            collect_workers: default_collect_workers(),
            fetch_workers: default_fetch_workers(),
            cooldown_secs: default_cooldown_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            folder_poll_attempts: default_folder_poll_attempts(),
            folder_poll_delay_ms: default_folder_poll_delay_ms(),
            max_response_bytes: default_max_response_bytes(),
            cache_path: None,
        }
    }
}

impl SyncConfig {
    /// Retry policy for API calls derived from this config.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            max_throttle_wait: Duration::from_secs(self.max_throttle_wait_secs),
        }
    }

    /// Inline-vs-pooled policy for rule pushes.
    #[must_use]
    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            inline_threshold: self.inline_threshold,
            batch_size: self.batch_size.max(1),
            workers: self.batch_workers.max(1),
        }
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Base wait between visibility polls; poll `n` waits `n + 1` times this.
    #[must_use]
    pub fn folder_poll_delay(&self) -> Duration {
        Duration::from_millis(self.folder_poll_delay_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolved location of the persisted definition cache.
    ///
    /// Falls back to `<platform cache dir>/ctrld-sync/blocklists.json`.
    #[must_use]
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        self.cache_path.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("ctrld-sync").join("blocklists.json"))
        })
    }

    /// Fast settings for tests (millisecond delays, short cooldown)
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 1,
            retry_max_ms: 10,
            max_throttle_wait_secs: 1,
            cooldown_secs: 0,
            heartbeat_secs: 1,
            folder_poll_attempts: 3,
            folder_poll_delay_ms: 1,
            ..Default::default()
        }
    }
}
