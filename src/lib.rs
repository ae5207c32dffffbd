//! # ctrld-sync
//!
//! Reconciles Control D profile folders against remote JSON blocklists.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Reconciler (per run)                     │
//! │  • Profiles one at a time, folders strictly in order       │
//! │  • Validate → Plan → Verify → Delete → Cooldown →          │
//! │    Collect → Process                                        │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │     Fetcher      │ │    Collector     │ │   BatchPusher    │
//! │ • URL guard      │ │ • root + folders │ │ • dedup/validate │
//! │ • ETag / 304     │ │ • 5 workers      │ │ • inline/pooled  │
//! │ • size ceiling   │ │                  │ │ • 3 workers      │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!          │                    │                     │
//!          │                    └──────────┬──────────┘
//!          ▼                               ▼
//! ┌──────────────────┐          ┌─────────────────────────────┐
//! │ DefinitionCache  │          │         ApiClient           │
//! │ (+ JSON on disk) │          │ • retry, jittered backoff   │
//! └──────────────────┘          │ • Retry-After, rate limits  │
//!                               └─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ctrld_sync::{ApiToken, Reconciler, RunMode, SyncConfig, SyncRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let token = ApiToken::new(std::env::var("TOKEN").unwrap_or_default());
//!     let reconciler = Reconciler::connect(SyncConfig::default(), &token).expect("client");
//!
//!     let report = reconciler
//!         .run(SyncRequest {
//!             profiles: vec!["abc123".into()],
//!             urls: vec!["https://lists.example.com/ads.json".into()],
//!             mode: RunMode { dry_run: true, no_delete: false },
//!         })
//!         .await;
//!
//!     println!("{}", serde_json::to_string_pretty(&report.plan).unwrap());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`Reconciler`] and its report types
//! - [`api`]: resilient REST client
//! - [`fetch`]: definition fetcher, cache, URL guard, document builder
//! - [`collector`]: existing-rule enumeration
//! - [`batching`]: execution policy and batch pusher
//! - [`registry`]: existing-rule registry
//! - [`resilience`]: retry and rate-limit tracking
//! - [`transport`]: HTTP and in-memory transports

pub mod config;
pub mod error;
pub mod sanitize;
pub mod validation;
pub mod model;
pub mod context;
pub mod transport;
pub mod resilience;
pub mod api;
pub mod fetch;
pub mod registry;
pub mod batching;
pub mod collector;
pub mod coordinator;
pub mod metrics;

pub use config::SyncConfig;
pub use error::{ApiError, CacheError, ErrorKind, FetchError, TransportError, ValidationError};
pub use sanitize::{sanitize_for_log, ApiToken};
pub use model::{FolderDefinition, RemoteFolder, RuleAction, RuleGroup};
pub use context::{CacheStats, RunContext, RunStats};
pub use api::ApiClient;
pub use fetch::{CachePersistence, DefinitionCache, Fetcher, HostResolver, UrlGuard};
pub use registry::RuleRegistry;
pub use batching::{BatchPusher, ExecutionPolicy, PushSummary};
pub use collector::{CollectionSummary, ExistingStateCollector};
pub use coordinator::{
    CancelHandle, FolderOutcome, FolderPlan, FolderReport, ProfileOutcome, ProfileReport, ProfileState,
    Reconciler, RunMode, RunReport, SyncPlanEntry, SyncRequest,
};
pub use resilience::rate_limit::{RateLimitState, RateLimitTracker};
pub use resilience::retry::RetryConfig;
pub use metrics::PhaseTimer;
