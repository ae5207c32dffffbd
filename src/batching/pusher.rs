// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch pusher.
//!
//! Sends one rule group's hostnames to a folder:
//!
//! 1. drop duplicates within the input (first occurrence wins)
//! 2. drop hostnames already in the [`RuleRegistry`]
//! 3. drop hostnames that fail rule validation (counted as `rejected`)
//! 4. send the remainder inline or as pooled batches per [`ExecutionPolicy`]
//!
//! Each successful batch is added to the registry as soon as it completes.
//! A failed batch is counted and the others carry on.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::strategy::{split_batches, ExecutionPolicy, Strategy};
use crate::api::ApiClient;
use crate::model::{RemoteFolder, RuleGroup};
use crate::registry::RuleRegistry;
use crate::sanitize::sanitize_for_log;
use crate::validation::is_valid_rule;

/// Result of pushing one or more rule groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    /// Hostnames accepted by the service
    pub pushed: usize,
    /// Duplicates, either within the input or already present remotely
    pub skipped: usize,
    /// Failed rule validation, never sent
    pub rejected: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Batches not started because the run was cancelled
    pub not_started: usize,
}

impl PushSummary {
    /// Every batch was sent and accepted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0 && self.not_started == 0
    }

    pub fn merge(&mut self, other: PushSummary) {
        self.pushed += other.pushed;
        self.skipped += other.skipped;
        self.rejected += other.rejected;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.not_started += other.not_started;
    }
}

#[derive(Clone)]
pub struct BatchPusher {
    api: ApiClient,
    policy: ExecutionPolicy,
}

impl BatchPusher {
    pub fn new(api: ApiClient, policy: ExecutionPolicy) -> Self {
        Self { api, policy }
    }

    #[tracing::instrument(skip_all, fields(profile = %profile, folder = %sanitize_for_log(&folder.name), hostnames = group.hostnames.len()))]
    pub async fn push(
        &self,
        profile: &str,
        folder: &RemoteFolder,
        group: &RuleGroup,
        registry: &Arc<RuleRegistry>,
        cancel: &watch::Receiver<bool>,
    ) -> PushSummary {
        let mut summary = PushSummary::default();
        let folder_name = sanitize_for_log(&folder.name);

        let missing = registry.filter_missing(&group.hostnames);
        let mut seen = HashSet::with_capacity(missing.len());
        let mut to_send = Vec::new();
        for hostname in missing {
            if !seen.insert(hostname.as_str()) {
                continue;
            }
            if !is_valid_rule(hostname) {
                warn!(folder = %folder_name, rule = %sanitize_for_log(hostname), "Skipping unsafe rule");
                summary.rejected += 1;
                continue;
            }
            to_send.push(hostname.clone());
        }
        summary.skipped = group.hostnames.len() - to_send.len() - summary.rejected;
        if summary.skipped > 0 {
            info!(folder = %folder_name, skipped = summary.skipped, "Skipping duplicate rules");
        }

        match self.policy.choose(to_send.len()) {
            Strategy::Skip => {
                info!(folder = %folder_name, "No new rules to push");
            }
            Strategy::Inline => {
                summary.batches = 1;
                if *cancel.borrow() {
                    summary.not_started = 1;
                } else {
                    let size = to_send.len();
                    if send_batch(&self.api, profile, folder, group, registry, 1, to_send).await {
                        summary.pushed = size;
                    } else {
                        summary.failed_batches = 1;
                    }
                }
            }
            Strategy::Pooled { batches } => {
                summary.batches = batches;
                let (pushed, failed, not_started) =
                    self.push_pooled(profile, folder, group, registry, cancel, to_send).await;
                summary.pushed = pushed;
                summary.failed_batches = failed;
                summary.not_started = not_started;
            }
        }

        crate::metrics::record_rules(summary.pushed, summary.skipped, summary.rejected);
        if summary.is_complete() {
            info!(folder = %folder_name, pushed = summary.pushed, "Folder rules finished");
        } else {
            error!(
                folder = %folder_name,
                succeeded = summary.batches - summary.failed_batches - summary.not_started,
                total = summary.batches,
                "Only some batches succeeded"
            );
        }
        summary
    }

    /// Fan batches out to at most `workers` concurrent calls. Cancellation
    /// stops new batches; batches already started run to completion.
    async fn push_pooled(
        &self,
        profile: &str,
        folder: &RemoteFolder,
        group: &RuleGroup,
        registry: &Arc<RuleRegistry>,
        cancel: &watch::Receiver<bool>,
        hostnames: Vec<String>,
    ) -> (usize, usize, usize) {
        let batches = split_batches(&hostnames, self.policy.batch_size);
        let total = batches.len();
        let semaphore = Arc::new(Semaphore::new(self.policy.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut started = 0;

        for (idx, batch) in batches.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if *cancel.borrow() {
                warn!(remaining = total - started, "Cancelled, not starting remaining batches");
                break;
            }
            started += 1;

            let api = self.api.clone();
            let registry = Arc::clone(registry);
            let profile = profile.to_string();
            let folder = folder.clone();
            let group = RuleGroup { action: group.action, enabled: group.enabled, hostnames: Vec::new() };
            tasks.spawn(async move {
                let _permit = permit;
                let size = batch.len();
                let ok = send_batch(&api, &profile, &folder, &group, &registry, idx + 1, batch).await;
                (ok, size)
            });
        }

        let mut pushed = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((true, size)) => pushed += size,
                Ok((false, _)) => failed += 1,
                Err(e) => {
                    error!(error = %e, "Batch task panicked");
                    failed += 1;
                }
            }
        }
        (pushed, failed, total - started)
    }
}

async fn send_batch(
    api: &ApiClient,
    profile: &str,
    folder: &RemoteFolder,
    group: &RuleGroup,
    registry: &RuleRegistry,
    index: usize,
    batch: Vec<String>,
) -> bool {
    let size = batch.len();
    match api.create_rules(profile, &folder.id, group.action, group.enabled, &batch).await {
        Ok(()) => {
            registry.extend(batch);
            crate::metrics::record_batch(true, size);
            info!(folder = %sanitize_for_log(&folder.name), batch = index, added = size, "Batch pushed");
            true
        }
        Err(e) => {
            crate::metrics::record_batch(false, size);
            error!(
                folder = %sanitize_for_log(&folder.name),
                batch = index,
                error = %e,
                "Failed to push batch"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::RunContext;
    use crate::fetch::cache::DefinitionCache;
    use crate::model::RuleAction;
    use crate::resilience::retry::RetryConfig;
    use crate::transport::memory::{FaultKind, MemoryApi};
    use crate::transport::Method;

    fn setup(policy: ExecutionPolicy) -> (Arc<MemoryApi>, BatchPusher, RemoteFolder) {
        let api = Arc::new(MemoryApi::new());
        let id = api.seed_folder("p1", "Ads", &[]);
        let ctx = RunContext::new(&SyncConfig::default(), Arc::new(DefinitionCache::new()));
        let client = ApiClient::new(Arc::clone(&api) as _, ctx, RetryConfig::test());
        (api, BatchPusher::new(client, policy), RemoteFolder { id, name: "Ads".into() })
    }

    fn group(hosts: impl IntoIterator<Item = String>) -> RuleGroup {
        RuleGroup { action: RuleAction::Block, enabled: true, hostnames: hosts.into_iter().collect() }
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_inline_push_dedups_and_validates() {
        let (api, pusher, folder) = setup(ExecutionPolicy::default());
        let registry = Arc::new(RuleRegistry::from_iter(["known.com"]));
        let hosts = ["a.com", "known.com", "a.com", "bad host", "b.com"].map(String::from);

        let summary = pusher.push("p1", &folder, &group(hosts), &registry, &not_cancelled()).await;
        assert_eq!(summary, PushSummary { pushed: 2, skipped: 2, rejected: 1, batches: 1, ..Default::default() });
        assert_eq!(api.folder_rules("p1", "Ads"), vec!["a.com", "b.com"]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_pooled_push_splits_batches() {
        let (api, pusher, folder) = setup(ExecutionPolicy::default());
        let registry = Arc::new(RuleRegistry::new());
        let hosts = (0..1200).map(|i| format!("h{i}.example.com"));

        let summary = pusher.push("p1", &folder, &group(hosts), &registry, &not_cancelled()).await;
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.pushed, 1200);
        assert!(summary.is_complete());

        let mut sizes: Vec<usize> =
            api.calls_matching(Method::Post, "/p1/rules").iter().map(|c| c.hostnames().len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![200, 500, 500]);
        assert_eq!(registry.len(), 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_does_not_stop_others() {
        let (api, pusher, folder) = setup(ExecutionPolicy { inline_threshold: 2, batch_size: 2, workers: 1 });
        // Exhaust every attempt of the first batch
        api.fail_next(Method::Post, "/p1/rules", FaultKind::Status { status: 503, retry_after: None }, 3);
        let registry = Arc::new(RuleRegistry::new());
        let hosts = (0..6).map(|i| format!("h{i}.com"));

        let summary = pusher.push("p1", &folder, &group(hosts), &registry, &not_cancelled()).await;
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.pushed, 4);
        assert_eq!(registry.len(), 4);
        assert!(!registry.contains("h0.com"));
    }

    #[tokio::test]
    async fn test_cancelled_push_starts_nothing() {
        let (api, pusher, folder) = setup(ExecutionPolicy { inline_threshold: 1, batch_size: 1, workers: 1 });
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);

        let summary = pusher.push("p1", &folder, &group(["a.com".into(), "b.com".into()]), &Arc::new(RuleRegistry::new()), &rx).await;
        assert_eq!(summary.not_started, 2);
        assert!(!summary.is_complete());
        assert!(api.calls_matching(Method::Post, "/p1/rules").is_empty());
    }
}
