// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for ctrld-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding binary is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `ctrld_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: list_folders, delete_folder, create_folder, list_rules, create_rules
//! - `status`: HTTP status code, or `transport_error` when no response arrived
//! - `phase`: validate, plan, verify, delete, cooldown, collect, process

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one API attempt and its status; `None` means no response arrived
pub fn record_api_call(operation: &str, status: Option<u16>) {
    counter!(
        "ctrld_sync_api_calls_total",
        "operation" => operation.to_string(),
        "status" => status_label(status)
    )
    .increment(1);
}

fn status_label(status: Option<u16>) -> String {
    status.map_or_else(|| "transport_error".to_string(), |s| s.to_string())
}

/// Record a scheduled retry
pub fn record_retry(operation: &str) {
    counter!(
        "ctrld_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a proactive wait on a nearly exhausted rate-limit window
pub fn record_throttle(wait: Duration) {
    counter!("ctrld_sync_throttle_waits_total").increment(1);
    histogram!("ctrld_sync_throttle_wait_seconds").record(wait.as_secs_f64());
}

/// Set requests remaining in the current rate-limit window
pub fn set_rate_limit_remaining(remaining: u64) {
    gauge!("ctrld_sync_rate_limit_remaining").set(remaining as f64);
}

/// Record a definition cache event (memo_hit, revalidated, miss, error)
pub fn record_cache(event: &'static str) {
    counter!(
        "ctrld_sync_definition_cache_total",
        "event" => event
    )
    .increment(1);
}

/// Record downloaded definition size
pub fn record_fetch_bytes(bytes: usize) {
    histogram!("ctrld_sync_fetch_bytes").record(bytes as f64);
}

/// Record one create-rules batch
pub fn record_batch(success: bool, size: usize) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "ctrld_sync_batches_total",
        "status" => status
    )
    .increment(1);
    histogram!("ctrld_sync_batch_size").record(size as f64);
}

/// Record rule push totals for a folder
pub fn record_rules(pushed: usize, skipped: usize, rejected: usize) {
    counter!("ctrld_sync_rules_pushed_total").increment(pushed as u64);
    counter!("ctrld_sync_rules_skipped_total").increment(skipped as u64);
    counter!("ctrld_sync_rules_rejected_total").increment(rejected as u64);
}

/// Record a folder deletion or creation
pub fn record_folder_operation(operation: &'static str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "ctrld_sync_folder_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record existing-rule registry size after collection
pub fn set_registry_size(size: usize) {
    gauge!("ctrld_sync_registry_size").set(size as f64);
}

/// Record phase latency
pub fn record_phase(phase: &'static str, duration: Duration) {
    histogram!(
        "ctrld_sync_phase_seconds",
        "phase" => phase
    )
    .record(duration.as_secs_f64());
}

/// Record final profile outcome (success, planned, failed, cancelled)
pub fn record_profile_outcome(outcome: &'static str) {
    counter!(
        "ctrld_sync_profiles_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// A timing guard that records phase latency on drop
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    /// Start a new phase timer
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        record_phase(self.phase, self.start.elapsed());
    }
}
