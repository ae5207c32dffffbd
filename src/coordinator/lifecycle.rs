// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-profile state machine.
//!
//! Each phase either returns the data the next phase needs or a terminal
//! [`ProfileOutcome`] (failure or cancellation). Folder-level problems are
//! written into the folder's report and never stop sibling folders.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use super::types::{
    cancelled, FolderOutcome, FolderPlan, FolderReport, ProfileOutcome, ProfileReport, ProfileState, RunMode,
    SyncPlanEntry,
};
use super::Reconciler;
use crate::api::ApiClient;
use crate::batching::BatchPusher;
use crate::collector::ExistingStateCollector;
use crate::error::{ApiError, ErrorKind, ValidationError};
use crate::fetch::Fetcher;
use crate::metrics::PhaseTimer;
use crate::model::{FolderDefinition, RemoteFolder};
use crate::registry::RuleRegistry;
use crate::sanitize::sanitize_for_log;
use crate::validation::{normalize_profile_id, validate_profile_id};

/// Components built once per run and shared by every profile.
pub(super) struct RunServices {
    pub api: ApiClient,
    pub fetcher: Fetcher,
    pub collector: ExistingStateCollector,
    pub pusher: BatchPusher,
}

/// Folder definition together with the index of its report.
type Planned = (usize, Arc<FolderDefinition>);

fn fail(reason: impl std::fmt::Display) -> ProfileOutcome {
    ProfileOutcome::Failed { reason: sanitize_for_log(&reason.to_string()) }
}

impl Reconciler {
    #[tracing::instrument(skip(self, run, raw_profile, urls), fields(profile = %sanitize_for_log(raw_profile)))]
    pub(super) async fn sync_profile(
        &self,
        run: &RunServices,
        raw_profile: &str,
        urls: &[String],
        mode: RunMode,
    ) -> (ProfileReport, Option<SyncPlanEntry>) {
        let started = StdInstant::now();
        let profile = normalize_profile_id(raw_profile);
        let mut cancel = self.cancel.subscribe();
        let mut report = ProfileReport {
            profile: sanitize_for_log(&profile),
            outcome: ProfileOutcome::Success,
            folders: Vec::new(),
            collection: None,
            duration: std::time::Duration::ZERO,
        };
        let mut plan = None;

        let outcome = match self.reconcile(run, &profile, urls, mode, &mut cancel, &mut report, &mut plan).await {
            Ok(()) => summarize(&report.folders, mode),
            Err(outcome) => outcome,
        };

        match &outcome {
            ProfileOutcome::Success | ProfileOutcome::Planned => {
                self.set_state(ProfileState::Done);
                info!(folders = report.folders.len(), rules = report.rules_pushed(), "Profile reconciled");
            }
            ProfileOutcome::Failed { reason } => {
                self.set_state(ProfileState::Failed);
                error!(reason = %reason, "Profile failed");
            }
            ProfileOutcome::Cancelled => {
                self.set_state(ProfileState::Failed);
                warn!("Profile cancelled, remote state left as is");
            }
        }

        report.outcome = outcome;
        report.duration = started.elapsed();
        (report, plan)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile(
        &self,
        run: &RunServices,
        profile: &str,
        urls: &[String],
        mode: RunMode,
        cancel: &mut watch::Receiver<bool>,
        report: &mut ProfileReport,
        plan: &mut Option<SyncPlanEntry>,
    ) -> Result<(), ProfileOutcome> {
        self.set_state(ProfileState::Validating);
        let urls = self.validate(run, profile, urls).await?;

        self.set_state(ProfileState::Planning);
        let definitions = self.plan(run, profile, &urls, report, plan).await?;
        if mode.dry_run {
            for (idx, _) in &definitions {
                report.folders[*idx].outcome = FolderOutcome::Planned;
            }
            info!(folders = definitions.len(), "Dry run complete, no API calls were made");
            return Ok(());
        }
        check_cancel(cancel)?;

        self.set_state(ProfileState::VerifyingAccess);
        let mut existing = verify_access(&run.api, profile).await?;

        if !mode.no_delete {
            self.set_state(ProfileState::Deleting);
            let deleted = self.delete_matching(run, profile, &definitions, &mut existing, report, cancel).await;
            check_cancel(cancel)?;
            if deleted > 0 {
                self.set_state(ProfileState::CoolingDown);
                self.cool_down(cancel).await?;
            }
        }
        check_cancel(cancel)?;

        self.set_state(ProfileState::CollectingExisting);
        let folders: Vec<RemoteFolder> =
            existing.into_iter().map(|(name, id)| RemoteFolder { id, name }).collect();
        let (registry, collection) = {
            let _timer = PhaseTimer::new("collect");
            run.collector.collect(profile, &folders).await
        };
        report.collection = Some(collection);
        if collection.is_failed() {
            return Err(fail("could not enumerate any existing rules"));
        }
        if collection.is_degraded() {
            warn!(failed = collection.failed, sources = collection.sources, "Existing-rule collection degraded");
        }

        self.set_state(ProfileState::ProcessingFolders);
        let _timer = PhaseTimer::new("process");
        for (idx, definition) in &definitions {
            check_cancel(cancel)?;
            if report.folders[*idx].delete_failed {
                continue;
            }
            self.process_folder(run, profile, definition, &registry, cancel, &mut report.folders[*idx]).await;
        }
        check_cancel(cancel)?;
        Ok(())
    }

    /// Profile id and every URL must pass before anything touches the API.
    async fn validate(&self, run: &RunServices, profile: &str, urls: &[String]) -> Result<Vec<String>, ProfileOutcome> {
        let _timer = PhaseTimer::new("validate");
        validate_profile_id(profile).map_err(fail)?;

        let mut seen = HashSet::new();
        let urls: Vec<String> = urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty() && seen.insert(u.clone()))
            .collect();
        if urls.is_empty() {
            return Err(fail(ValidationError::NoSources));
        }

        for url in &urls {
            run.fetcher.validate_url(url).await.map_err(fail)?;
        }
        Ok(urls)
    }

    /// Fetch and build every definition, record the plan entry.
    async fn plan(
        &self,
        run: &RunServices,
        profile: &str,
        urls: &[String],
        report: &mut ProfileReport,
        plan: &mut Option<SyncPlanEntry>,
    ) -> Result<Vec<Planned>, ProfileOutcome> {
        let _timer = PhaseTimer::new("plan");
        let mut names = HashSet::new();
        let mut definitions = Vec::new();

        for (url, result) in run.fetcher.fetch_all(urls).await {
            match result {
                Ok(definition) if names.insert(definition.name.clone()) => {
                    report.folders.push(FolderReport::new(&definition.name, sanitize_for_log(&url)));
                    definitions.push((report.folders.len() - 1, definition));
                }
                Ok(definition) => {
                    let err = ValidationError::DuplicateFolder(sanitize_for_log(&definition.name));
                    error!(url = %sanitize_for_log(&url), error = %err, "Skipping folder");
                    let mut folder = FolderReport::new(&definition.name, sanitize_for_log(&url));
                    folder.outcome = FolderOutcome::Failed { reason: err.to_string(), kind: ErrorKind::Validation };
                    report.folders.push(folder);
                }
                Err(e) => {
                    error!(url = %sanitize_for_log(&url), error = %e, "Failed to fetch folder data");
                    let mut folder = FolderReport::new(sanitize_for_log(&url), sanitize_for_log(&url));
                    folder.outcome = FolderOutcome::Failed { reason: e.to_string(), kind: e.kind() };
                    report.folders.push(folder);
                }
            }
        }

        if definitions.is_empty() {
            return Err(fail("no valid folder data"));
        }

        let policy = self.config.execution_policy();
        let entry = SyncPlanEntry {
            profile: profile.to_string(),
            folders: definitions.iter().map(|(_, d)| FolderPlan::new(d, &policy)).collect(),
        };
        info!(folders = entry.folders.len(), rules = entry.total_rules(), "Plan ready");
        *plan = Some(entry);
        Ok(definitions)
    }

    /// Delete remote folders that share a name with a desired folder.
    /// Returns how many were deleted.
    async fn delete_matching(
        &self,
        run: &RunServices,
        profile: &str,
        definitions: &[Planned],
        existing: &mut HashMap<String, String>,
        report: &mut ProfileReport,
        cancel: &watch::Receiver<bool>,
    ) -> usize {
        let _timer = PhaseTimer::new("delete");
        let semaphore = Arc::new(Semaphore::new(self.config.delete_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, definition) in definitions {
            let Some(folder_id) = existing.get(&definition.name).cloned() else {
                continue;
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if *cancel.borrow() {
                break;
            }
            let api = run.api.clone();
            let profile = profile.to_string();
            let idx = *idx;
            tasks.spawn(async move {
                let _permit = permit;
                (idx, api.delete_folder(&profile, &folder_id).await)
            });
        }

        let mut deleted = 0;
        while let Some(joined) = tasks.join_next().await {
            let (idx, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Delete task panicked");
                    continue;
                }
            };
            let folder = &mut report.folders[idx];
            match result {
                Ok(()) => {
                    info!(folder = %sanitize_for_log(&folder.name), "Deleted folder");
                    existing.remove(&folder.name);
                    folder.deleted = true;
                    deleted += 1;
                    crate::metrics::record_folder_operation("delete", true);
                }
                Err(e) => {
                    error!(folder = %sanitize_for_log(&folder.name), error = %e, "Failed to delete folder");
                    folder.delete_failed = true;
                    // creating now would leave two folders with this name
                    folder.outcome = FolderOutcome::Failed {
                        reason: format!("could not replace existing folder: {e}"),
                        kind: ErrorKind::PartialFailure,
                    };
                    crate::metrics::record_folder_operation("delete", false);
                }
            }
        }
        deleted
    }

    /// Wait out the post-delete cooldown, logging a heartbeat periodically.
    async fn cool_down(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), ProfileOutcome> {
        let total = self.config.cooldown();
        if total.is_zero() {
            return Ok(());
        }
        let _timer = PhaseTimer::new("cooldown");
        info!(secs = total.as_secs(), "Waiting for deletions to propagate");

        let deadline = Instant::now() + total;
        let heartbeat = self.config.heartbeat();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::select! {
                () = sleep(heartbeat.min(deadline - now)) => {}
                () = cancelled(cancel) => {
                    warn!("Cancelled during cooldown");
                    return Err(ProfileOutcome::Cancelled);
                }
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                info!(remaining_secs = left.as_secs(), "Cooldown in progress");
            }
        }
    }

    /// Create one folder and push its rule groups.
    async fn process_folder(
        &self,
        run: &RunServices,
        profile: &str,
        definition: &FolderDefinition,
        registry: &Arc<RuleRegistry>,
        cancel: &watch::Receiver<bool>,
        folder: &mut FolderReport,
    ) {
        let name = sanitize_for_log(&definition.name);
        let created = run.api.create_folder(profile, &definition.name, definition.action, definition.enabled).await;

        let folder_id = match created {
            Ok(Some(id)) => id,
            Ok(None) => match self.await_visible(&run.api, profile, &definition.name).await {
                Some(id) => id,
                None => {
                    crate::metrics::record_folder_operation("create", false);
                    folder.outcome = FolderOutcome::NotYetVisible;
                    return;
                }
            },
            Err(e) => {
                error!(folder = %name, error = %e, "Failed to create folder");
                crate::metrics::record_folder_operation("create", false);
                folder.outcome = FolderOutcome::Failed { reason: e.to_string(), kind: e.kind() };
                return;
            }
        };
        crate::metrics::record_folder_operation("create", true);

        let remote = RemoteFolder { id: folder_id, name: definition.name.clone() };
        for group in &definition.groups {
            let summary = run.pusher.push(profile, &remote, group, registry, cancel).await;
            folder.push.merge(summary);
        }
        folder.outcome = if folder.push.is_complete() { FolderOutcome::Synced } else { FolderOutcome::Incomplete };
    }

    /// Poll the folder listing until `name` shows up. Poll `n` waits
    /// `(n + 1) × folder_poll_delay` before the next one.
    async fn await_visible(&self, api: &ApiClient, profile: &str, name: &str) -> Option<String> {
        let attempts = self.config.folder_poll_attempts.max(1);
        let target = name.trim();

        for attempt in 0..attempts {
            match api.list_folders(profile).await {
                Ok(folders) => {
                    if let Some(found) = folders.into_iter().find(|f| f.name == target) {
                        info!(folder = %sanitize_for_log(name), folder_id = %found.id, polls = attempt + 1, "Folder visible");
                        return Some(found.id);
                    }
                }
                Err(e) => warn!(attempt, error = %e, "Error listing folders while waiting for creation"),
            }

            if attempt + 1 < attempts {
                let wait = self.config.folder_poll_delay() * (attempt + 1);
                info!(folder = %sanitize_for_log(name), wait_ms = wait.as_millis() as u64, "Folder not visible yet");
                sleep(wait).await;
            }
        }

        error!(folder = %sanitize_for_log(name), attempts, "Folder not visible after creation");
        None
    }
}

/// One listing call doubles as the credential check.
async fn verify_access(api: &ApiClient, profile: &str) -> Result<HashMap<String, String>, ProfileOutcome> {
    let _timer = PhaseTimer::new("verify");
    match api.list_folders(profile).await {
        Ok(folders) => Ok(folders.into_iter().map(|f| (f.name, f.id)).collect()),
        Err(e) => {
            log_access_failure(profile, &e);
            Err(fail(e))
        }
    }
}

fn log_access_failure(profile: &str, err: &ApiError) {
    let profile = sanitize_for_log(profile);
    match err.status() {
        Some(401) => error!(error = %err, "Authentication failed: the API token is invalid"),
        Some(403) => error!(profile = %profile, error = %err, "Access denied: token lacks permission for this profile"),
        Some(404) => error!(profile = %profile, error = %err, "Profile not found: check the id from the dashboard URL"),
        _ => error!(profile = %profile, error = %err, "Access check failed"),
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), ProfileOutcome> {
    if *cancel.borrow() { Err(ProfileOutcome::Cancelled) } else { Ok(()) }
}

fn summarize(folders: &[FolderReport], mode: RunMode) -> ProfileOutcome {
    let failed = folders.iter().filter(|f| !f.is_success()).count();
    if failed > 0 {
        fail(format!("{failed} of {} folders failed", folders.len()))
    } else if mode.dry_run {
        ProfileOutcome::Planned
    } else {
        ProfileOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize() {
        let mut ok = FolderReport::new("A", "https://a");
        ok.outcome = FolderOutcome::Synced;
        let mut bad = FolderReport::new("B", "https://b");
        bad.outcome = FolderOutcome::Incomplete;

        assert_eq!(summarize(&[ok.clone()], RunMode::default()), ProfileOutcome::Success);
        assert!(matches!(summarize(&[ok.clone(), bad], RunMode::default()), ProfileOutcome::Failed { .. }));

        let mut stale = ok.clone();
        stale.delete_failed = true;
        assert!(matches!(summarize(&[ok, stale], RunMode::default()), ProfileOutcome::Failed { .. }));
    }

    #[test]
    fn test_check_cancel() {
        let (tx, rx) = watch::channel(false);
        assert!(check_cancel(&rx).is_ok());
        tx.send_replace(true);
        assert_eq!(check_cancel(&rx), Err(ProfileOutcome::Cancelled));
    }
}
