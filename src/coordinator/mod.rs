// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation orchestrator.
//!
//! The [`Reconciler`] ties the components together for one run:
//! - [`Fetcher`] for folder definitions (cache-backed, URL-guarded)
//! - [`ApiClient`] for every REST call (retries, rate-limit tracking)
//! - [`ExistingStateCollector`] for the dedup registry
//! - [`BatchPusher`] for rule transmission
//!
//! Profiles are reconciled one at a time; within a profile folders are
//! created and filled strictly in order.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Validating → Planning → VerifyingAccess → Deleting → CoolingDown
//!      → CollectingExisting → ProcessingFolders → Done | Failed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ctrld_sync::{ApiToken, Reconciler, RunMode, SyncConfig, SyncRequest};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let reconciler = Reconciler::connect(SyncConfig::default(), &ApiToken::new("token")).unwrap();
//! let report = reconciler
//!     .run(SyncRequest {
//!         profiles: vec!["abc123".into()],
//!         urls: vec!["https://lists.example.com/ads.json".into()],
//!         mode: RunMode::default(),
//!     })
//!     .await;
//! std::process::exit(report.exit_code());
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{
    CancelHandle, FolderOutcome, FolderPlan, FolderReport, ProfileOutcome, ProfileReport, ProfileState,
    RuleGroupPlan, RunMode, RunReport, SyncPlanEntry, SyncRequest,
};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::batching::BatchPusher;
use crate::collector::ExistingStateCollector;
use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::error::TransportError;
use crate::fetch::{CachePersistence, DefinitionCache, Fetcher, LoadReport, UrlGuard};
use crate::sanitize::ApiToken;
use crate::transport::http::HttpTransport;
use crate::transport::{ApiTransport, DocumentSource};

use lifecycle::RunServices;

/// Reconciles profiles against remote folder definitions.
///
/// One instance can serve several runs; the definition cache is kept
/// between them so later runs revalidate instead of downloading again.
pub struct Reconciler {
    pub(super) config: SyncConfig,
    pub(super) transport: Arc<dyn ApiTransport>,
    pub(super) source: Arc<dyn DocumentSource>,
    pub(super) cache: Arc<DefinitionCache>,
    pub(super) guard: UrlGuard,
    pub(super) persistence: Option<CachePersistence>,

    /// Current profile state (broadcast to watchers)
    pub(super) state: watch::Sender<ProfileState>,
    state_rx: watch::Receiver<ProfileState>,

    pub(super) cancel: Arc<watch::Sender<bool>>,
}

impl Reconciler {
    pub fn new(config: SyncConfig, transport: Arc<dyn ApiTransport>, source: Arc<dyn DocumentSource>) -> Self {
        let (state_tx, state_rx) = watch::channel(ProfileState::Idle);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            transport,
            source,
            cache: Arc::new(DefinitionCache::new()),
            guard: UrlGuard::default(),
            persistence: None,
            state: state_tx,
            state_rx,
            cancel: Arc::new(cancel_tx),
        }
    }

    /// Production wiring: one `reqwest` transport for the API and the
    /// definition downloads, and the persisted cache loaded from disk.
    pub fn connect(config: SyncConfig, token: &ApiToken) -> Result<Self, TransportError> {
        let http = Arc::new(HttpTransport::new(&config, token)?);
        let persistence = config.resolved_cache_path().map(CachePersistence::new);
        let mut reconciler = Self::new(config, Arc::clone(&http) as Arc<dyn ApiTransport>, http);
        if let Some(persistence) = persistence {
            reconciler = reconciler.with_persistence(persistence);
            reconciler.load_cache();
        }
        Ok(reconciler)
    }

    #[must_use]
    pub fn with_guard(mut self, guard: UrlGuard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<DefinitionCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Save the definition cache here after every non-dry run.
    #[must_use]
    pub fn with_persistence(mut self, persistence: CachePersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Populate the cache from the persistence file. Any problem degrades
    /// to a cold cache.
    pub fn load_cache(&self) -> LoadReport {
        self.persistence
            .as_ref()
            .map(|p| p.load_or_cold(&self.cache))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DefinitionCache> {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ProfileState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ProfileState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.cancel))
    }

    /// Reconcile every profile in `request`, one after another.
    #[tracing::instrument(skip_all, fields(profiles = request.profiles.len(), urls = request.urls.len(), dry_run = request.mode.dry_run))]
    pub async fn run(&self, request: SyncRequest) -> RunReport {
        self.cancel.send_replace(false);
        let ctx = RunContext::new(&self.config, Arc::clone(&self.cache));
        let api = ApiClient::new(Arc::clone(&self.transport), Arc::clone(&ctx), self.config.retry_config());
        let services = RunServices {
            fetcher: Fetcher::new(Arc::clone(&self.source), self.guard.clone(), Arc::clone(&ctx), &self.config),
            collector: ExistingStateCollector::new(api.clone(), self.config.collect_workers),
            pusher: BatchPusher::new(api.clone(), self.config.execution_policy()),
            api,
        };

        let mut profiles = Vec::with_capacity(request.profiles.len());
        let mut plan = Vec::new();
        for raw in &request.profiles {
            if *self.cancel.borrow() {
                warn!("Cancelled, remaining profiles not started");
                break;
            }
            let (report, entry) = self.sync_profile(&services, raw, &request.urls, request.mode).await;
            crate::metrics::record_profile_outcome(report.outcome.as_str());
            let cancelled = report.outcome == ProfileOutcome::Cancelled;
            profiles.push(report);
            plan.extend(entry);
            if cancelled {
                break;
            }
        }
        self.set_state(ProfileState::Idle);

        let stats = ctx.finish();
        if !request.mode.dry_run {
            self.save_cache();
        }

        let succeeded = profiles.iter().filter(|p| p.is_success()).count();
        info!(
            succeeded,
            total = profiles.len(),
            api_calls = stats.api_calls,
            retries = stats.retries,
            cache_hits = stats.cache.hits(),
            cache_misses = stats.cache.misses,
            "Run complete"
        );
        RunReport { requested: request.profiles.len(), profiles, plan, stats }
    }

    fn save_cache(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(e) = persistence.save(&self.cache) {
            warn!(path = %persistence.path().display(), error = %e, "Failed to save definition cache");
            crate::metrics::record_cache("error");
        }
    }

    pub(super) fn set_state(&self, state: ProfileState) {
        self.state.send_replace(state);
    }
}
