// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Existing-state collector.
//!
//! Enumerates the rules already present for a profile (root plus every known
//! folder) into a fresh [`RuleRegistry`]. Sources are listed concurrently,
//! at most `collect_workers` at a time. A source that fails is logged and
//! contributes nothing; collection as a whole fails only when every source
//! fails.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::model::RemoteFolder;
use crate::registry::RuleRegistry;
use crate::sanitize::sanitize_for_log;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    /// Root plus one per folder
    pub sources: usize,
    pub failed: usize,
    pub rules: usize,
}

impl CollectionSummary {
    /// Some sources failed but at least one was read.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.failed > 0 && self.failed < self.sources
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.sources > 0 && self.failed == self.sources
    }
}

#[derive(Clone)]
pub struct ExistingStateCollector {
    api: ApiClient,
    workers: usize,
}

impl ExistingStateCollector {
    pub fn new(api: ApiClient, workers: usize) -> Self {
        Self { api, workers: workers.max(1) }
    }

    #[tracing::instrument(skip(self, folders), fields(folders = folders.len()))]
    pub async fn collect(&self, profile: &str, folders: &[RemoteFolder]) -> (Arc<RuleRegistry>, CollectionSummary) {
        let registry = Arc::new(RuleRegistry::new());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        let sources = std::iter::once(None).chain(folders.iter().map(|f| Some(f.clone())));
        for source in sources {
            let api = self.api.clone();
            let registry = Arc::clone(&registry);
            let semaphore = Arc::clone(&semaphore);
            let profile = profile.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let folder_id = source.as_ref().map(|f| f.id.as_str());
                match api.list_rules(&profile, folder_id).await {
                    Ok(rules) => {
                        registry.extend(rules);
                        true
                    }
                    Err(e) => {
                        let name = source.as_ref().map_or("<root>", |f| f.name.as_str());
                        warn!(
                            folder = %sanitize_for_log(name),
                            error = %e,
                            "Failed to list existing rules, folder contributes nothing"
                        );
                        false
                    }
                }
            });
        }

        let mut summary = CollectionSummary { sources: folders.len() + 1, ..Default::default() };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Rule listing task panicked");
                    summary.failed += 1;
                }
            }
        }
        summary.rules = registry.len();

        info!(rules = summary.rules, sources = summary.sources, failed = summary.failed, "Collected existing rules");
        (registry, summary)
    }
}
