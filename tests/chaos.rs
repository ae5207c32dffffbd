//! Chaos tests for the reconciler.
//!
//! Failures are scripted on the in-memory service per method and path
//! prefix: server errors, rate limiting, timeouts and rejected requests.
//! Tests that measure waits run on paused tokio time, so the gaps between
//! recorded attempts are exact and the suite stays fast.
//!
//! Run with: `cargo test --test chaos`

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};

use ctrld_sync::transport::memory::{CallRecord, FaultKind, MemoryApi, MemorySource};
use ctrld_sync::transport::Method;
use ctrld_sync::{
    ErrorKind, FolderOutcome, HostResolver, ProfileOutcome, Reconciler, RunMode, SyncConfig, SyncRequest, UrlGuard,
};

struct PublicResolver;

#[async_trait]
impl HostResolver for PublicResolver {
    async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
    }
}

fn harness(config: SyncConfig) -> (Arc<MemoryApi>, Arc<MemorySource>, Reconciler) {
    let api = Arc::new(MemoryApi::new());
    let source = Arc::new(MemorySource::new());
    let reconciler = Reconciler::new(config, Arc::clone(&api) as _, Arc::clone(&source) as _)
        .with_guard(UrlGuard::new(Arc::new(PublicResolver)));
    (api, source, reconciler)
}

fn doc(name: &str, hosts: &[String]) -> Value {
    let rules: Vec<Value> = hosts.iter().map(|h| json!({"PK": h})).collect();
    json!({"group": {"group": name}, "rules": rules})
}

fn hosts(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}.example.com")).collect()
}

fn request(urls: &[&str]) -> SyncRequest {
    SyncRequest {
        profiles: vec!["p1".into()],
        urls: urls.iter().map(|u| u.to_string()).collect(),
        mode: RunMode::default(),
    }
}

fn gaps(calls: &[CallRecord]) -> Vec<Duration> {
    calls.windows(2).map(|w| w[1].at.duration_since(w[0].at)).collect()
}

/// Second-scale backoff so paused-time gaps are easy to bound.
fn slow_retry_config() -> SyncConfig {
    SyncConfig { retry_base_ms: 1_000, retry_max_ms: 60_000, ..SyncConfig::for_tests() }
}

const ADS: &str = "https://lists.example.com/ads.json";
const TRACKERS: &str = "https://lists.example.com/trackers.json";

// =============================================================================
// Existing-state collection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_unreadable_folder_degrades_collection() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    let mut ids = Vec::new();
    for i in 0..5 {
        let rules = [format!("f{i}.example.com")];
        let rules: Vec<&str> = rules.iter().map(String::as_str).collect();
        ids.push(api.seed_folder("p1", &format!("Folder{i}"), &rules));
    }
    api.fail_next(
        Method::Get,
        &format!("/p1/rules/{}", ids[2]),
        FaultKind::Status { status: 500, retry_after: None },
        100,
    );
    source.insert(ADS, &doc("New", &hosts("f", 5)));

    let report = reconciler.run(request(&[ADS])).await;
    let profile = &report.profiles[0];

    let collection = profile.collection.unwrap();
    assert_eq!((collection.sources, collection.failed, collection.rules), (6, 1, 4));
    assert!(collection.is_degraded());
    assert_eq!(profile.outcome, ProfileOutcome::Success);
    // only the rule of the unreadable folder is unknown
    assert_eq!(api.folder_rules("p1", "New"), vec!["f2.example.com"]);
    assert_eq!(api.calls_matching(Method::Get, &format!("/p1/rules/{}", ids[2])).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_profile_fails_collection() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    api.seed_folder("p1", "Old", &["old.example.com"]);
    api.fail_next(Method::Get, "/p1/rules", FaultKind::Status { status: 502, retry_after: None }, 100);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));

    let report = reconciler.run(request(&[ADS])).await;

    assert!(matches!(report.profiles[0].outcome, ProfileOutcome::Failed { .. }));
    assert!(report.profiles[0].collection.unwrap().is_failed());
    assert!(api.calls_matching(Method::Post, "/p1/groups").is_empty());
}

// =============================================================================
// Retry behaviour
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_server_errors_back_off_with_jitter() {
    let (api, source, reconciler) = harness(slow_retry_config());
    api.fail_next(Method::Post, "/p1/groups", FaultKind::Status { status: 500, retry_after: None }, 2);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));

    let report = reconciler.run(request(&[ADS])).await;
    assert_eq!(report.profiles[0].outcome, ProfileOutcome::Success);

    let attempts = api.calls_matching(Method::Post, "/p1/groups");
    let statuses: Vec<Option<u16>> = attempts.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![Some(500), Some(500), Some(200)]);

    let retry = slow_retry_config().retry_config();
    for (n, gap) in gaps(&attempts).into_iter().enumerate() {
        let (lo, hi) = retry.delay_bounds(n as u32);
        assert!(gap >= lo, "retry {n}: {gap:?} < {lo:?}");
        assert!(gap <= hi + Duration::from_millis(1), "retry {n}: {gap:?} > {hi:?}");
    }
    assert_eq!(report.stats.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_is_honored() {
    let (api, source, reconciler) = harness(slow_retry_config());
    api.fail_next(Method::Post, "/p1/rules", FaultKind::Status { status: 429, retry_after: Some(5) }, 1);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));

    let report = reconciler.run(request(&[ADS])).await;
    assert_eq!(report.profiles[0].outcome, ProfileOutcome::Success);

    let attempts = api.calls_matching(Method::Post, "/p1/rules");
    assert_eq!(attempts.len(), 2);
    let gap = attempts[1].at.duration_since(attempts[0].at);
    assert!(gap >= Duration::from_secs(5));
    assert!(gap <= Duration::from_secs(5) + Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    api.fail_next(Method::Post, "/p1/groups", FaultKind::Status { status: 400, retry_after: None }, 1);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));
    source.insert(TRACKERS, &doc("Trackers", &hosts("t", 2)));

    let report = reconciler.run(request(&[ADS, TRACKERS])).await;
    let folders = &report.profiles[0].folders;

    assert!(matches!(folders[0].outcome, FolderOutcome::Failed { kind: ErrorKind::FatalApi, .. }));
    assert_eq!(folders[1].outcome, FolderOutcome::Synced);
    assert!(matches!(report.profiles[0].outcome, ProfileOutcome::Failed { .. }));
    // one failed attempt for Ads, one successful create for Trackers
    assert_eq!(api.calls_matching(Method::Post, "/p1/groups").len(), 2);
    assert_eq!(report.stats.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_exhaust_access_check() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    api.fail_next(Method::Get, "/p1/groups", FaultKind::Timeout, 10);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));

    let report = reconciler.run(request(&[ADS])).await;

    assert!(matches!(report.profiles[0].outcome, ProfileOutcome::Failed { .. }));
    let attempts = api.calls_matching(Method::Get, "/p1/groups");
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|c| c.status.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_delete_keeps_single_folder() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    let id = api.seed_folder("p1", "Ads", &["old.example.com"]);
    api.fail_next(
        Method::Delete,
        &format!("/p1/groups/{id}"),
        FaultKind::Status { status: 500, retry_after: None },
        100,
    );
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));
    source.insert(TRACKERS, &doc("Trackers", &hosts("t", 2)));

    let report = reconciler.run(request(&[ADS, TRACKERS])).await;
    let folders = &report.profiles[0].folders;

    assert!(folders[0].delete_failed);
    assert!(matches!(folders[0].outcome, FolderOutcome::Failed { kind: ErrorKind::PartialFailure, .. }));
    assert_eq!(folders[1].outcome, FolderOutcome::Synced);
    assert!(matches!(report.profiles[0].outcome, ProfileOutcome::Failed { .. }));
    assert_eq!(report.exit_code(), 1);

    let ads = api.folders("p1").into_iter().filter(|f| f.name == "Ads").count();
    assert_eq!(ads, 1);
    assert_eq!(api.folder_rules("p1", "Ads"), vec!["old.example.com"]);
    // only Trackers is created
    assert_eq!(api.calls_matching(Method::Post, "/p1/groups").len(), 1);
}

// =============================================================================
// Partial pushes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_batch_marks_folder_incomplete() {
    let config = SyncConfig { batch_workers: 1, ..SyncConfig::for_tests() };
    let (api, source, reconciler) = harness(config);
    api.fail_next(Method::Post, "/p1/rules", FaultKind::Status { status: 503, retry_after: None }, 3);
    source.insert(ADS, &doc("Ads", &hosts("a", 1200)));

    let report = reconciler.run(request(&[ADS])).await;
    let folder = &report.profiles[0].folders[0];

    assert_eq!(folder.outcome, FolderOutcome::Incomplete);
    assert_eq!(folder.push.failed_batches, 1);
    assert_eq!(folder.push.pushed, 700);
    assert!(matches!(report.profiles[0].outcome, ProfileOutcome::Failed { .. }));
    assert_eq!(api.folder_rules("p1", "Ads").len(), 700);
}

#[tokio::test(start_paused = true)]
async fn test_rerun_after_partial_push_sends_only_missing_rules() {
    let config = SyncConfig { batch_workers: 1, ..SyncConfig::for_tests() };
    let (api, source, reconciler) = harness(config);
    api.fail_next(Method::Post, "/p1/rules", FaultKind::Status { status: 503, retry_after: None }, 3);
    source.insert(ADS, &doc("Ads", &hosts("a", 1200)));
    reconciler.run(request(&[ADS])).await;

    let mut rerun = request(&[ADS]);
    rerun.mode.no_delete = true;
    let report = reconciler.run(rerun).await;
    let folder = &report.profiles[0].folders[0];

    assert_eq!(folder.outcome, FolderOutcome::Synced);
    assert_eq!((folder.push.pushed, folder.push.skipped), (500, 700));
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_nearly_exhausted_window_throttles() {
    let (api, source, reconciler) = harness(SyncConfig::for_tests());
    let reset = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 30;
    api.with_rate_limit(100, 3, reset);
    source.insert(ADS, &doc("Ads", &hosts("a", 2)));

    let report = reconciler.run(request(&[ADS])).await;

    assert_eq!(report.profiles[0].outcome, ProfileOutcome::Success);
    assert!(report.stats.throttle_waits >= 1);
    assert_eq!(report.stats.rate_limit.limit, Some(100));
    assert_eq!(report.stats.rate_limit.reset, Some(reset));
}
