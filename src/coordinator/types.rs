// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the reconciliation orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::batching::{ExecutionPolicy, PushSummary, Strategy};
use crate::collector::CollectionSummary;
use crate::context::RunStats;
use crate::error::ErrorKind;
use crate::model::{FolderDefinition, RuleAction};

/// Per-profile reconciliation state.
///
/// Use [`super::Reconciler::state_receiver()`] to watch transitions.
///
/// ```text
/// Validate → Plan → [dry run: Done] → VerifyAccess → Delete → Cooldown
///          → CollectExisting → ProcessFolders → Done | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileState {
    /// No profile in progress
    Idle,
    Validating,
    Planning,
    /// Access check and folder listing (one call)
    VerifyingAccess,
    Deleting,
    /// Waiting for deletions to propagate
    CoolingDown,
    CollectingExisting,
    ProcessingFolders,
    Done,
    Failed,
}

impl std::fmt::Display for ProfileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Validating => write!(f, "Validating"),
            Self::Planning => write!(f, "Planning"),
            Self::VerifyingAccess => write!(f, "VerifyingAccess"),
            Self::Deleting => write!(f, "Deleting"),
            Self::CoolingDown => write!(f, "CoolingDown"),
            Self::CollectingExisting => write!(f, "CollectingExisting"),
            Self::ProcessingFolders => write!(f, "ProcessingFolders"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunMode {
    /// Build the plan only; no API calls.
    pub dry_run: bool,
    /// Keep same-named folders instead of deleting them first.
    pub no_delete: bool,
}

/// Validated input from the embedding application.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Profile ids or dashboard URLs
    pub profiles: Vec<String>,
    /// Definition URLs, applied to every profile
    pub urls: Vec<String>,
    pub mode: RunMode,
}

/// Planned shape of one rule group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleGroupPlan {
    pub rules: usize,
    pub action: RuleAction,
    pub enabled: bool,
}

/// Planned shape of one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderPlan {
    pub name: String,
    pub rules: usize,
    /// Create-rules calls needed before deduplication
    pub batches: usize,
    pub action: RuleAction,
    pub enabled: bool,
    pub block: usize,
    pub allow: usize,
    pub rule_groups: Vec<RuleGroupPlan>,
}

impl FolderPlan {
    pub fn new(definition: &FolderDefinition, policy: &ExecutionPolicy) -> Self {
        let (block, allow) = definition.action_breakdown();
        let batches = definition
            .groups
            .iter()
            .map(|g| match policy.choose(g.hostnames.len()) {
                Strategy::Skip => 0,
                Strategy::Inline => 1,
                Strategy::Pooled { batches } => batches,
            })
            .sum();
        Self {
            name: definition.name.clone(),
            rules: definition.total_rules(),
            batches,
            action: definition.action,
            enabled: definition.enabled,
            block,
            allow,
            rule_groups: definition
                .groups
                .iter()
                .map(|g| RuleGroupPlan { rules: g.hostnames.len(), action: g.action, enabled: g.enabled })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPlanEntry {
    pub profile: String,
    pub folders: Vec<FolderPlan>,
}

impl SyncPlanEntry {
    #[must_use]
    pub fn total_rules(&self) -> usize {
        self.folders.iter().map(|f| f.rules).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FolderOutcome {
    /// Created and every batch accepted
    Synced,
    /// Planned only (dry run)
    Planned,
    Failed { reason: String, kind: ErrorKind },
    /// Created, but the folder never showed up in the listing
    NotYetVisible,
    /// Created, but some batches failed or never started
    Incomplete,
    /// Not reached because the run was cancelled
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    /// Folder name, or the sanitized source URL when the document never parsed
    pub name: String,
    pub source_url: String,
    pub deleted: bool,
    pub delete_failed: bool,
    pub push: PushSummary,
    pub outcome: FolderOutcome,
}

impl FolderReport {
    pub(crate) fn new(name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_url: source_url.into(),
            deleted: false,
            delete_failed: false,
            push: PushSummary::default(),
            outcome: FolderOutcome::Skipped,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.delete_failed && matches!(self.outcome, FolderOutcome::Synced | FolderOutcome::Planned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProfileOutcome {
    Success,
    /// Dry run finished
    Planned,
    Failed { reason: String },
    Cancelled,
}

impl ProfileOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Planned => "planned",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    pub profile: String,
    pub outcome: ProfileOutcome,
    pub folders: Vec<FolderReport>,
    pub collection: Option<CollectionSummary>,
    pub duration: Duration,
}

impl ProfileReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProfileOutcome::Success | ProfileOutcome::Planned)
    }

    #[must_use]
    pub fn rules_pushed(&self) -> usize {
        self.folders.iter().map(|f| f.push.pushed).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Profiles named in the request; more than `profiles.len()` when a
    /// cancel stopped the run early
    pub requested: usize,
    pub profiles: Vec<ProfileReport>,
    pub plan: Vec<SyncPlanEntry>,
    pub stats: RunStats,
}

impl RunReport {
    /// `0` when every requested profile ran and succeeded (or was
    /// planned), `1` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let all_ran = self.profiles.len() >= self.requested;
        if all_ran && self.profiles.iter().all(ProfileReport::is_success) { 0 } else { 1 }
    }
}

/// Requests cancellation of a running reconciliation.
///
/// Work already submitted drains; nothing new starts. The profile in
/// progress is reported as [`ProfileOutcome::Cancelled`] and later profiles
/// are not started. The flag is cleared when the next run begins.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once `rx` reports cancellation. Never resolves if the sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
