// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Run-scoped shared state.
//!
//! One [`RunContext`] is created per reconciliation run and handed (as an
//! `Arc`) to the API client and the fetcher. It owns the rate-limit window,
//! the per-run definition memo and the counters reported at teardown. The
//! definition cache it points to outlives the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::ValidationError;
use crate::fetch::cache::DefinitionCache;
use crate::model::FolderDefinition;
use crate::resilience::rate_limit::{RateLimitState, RateLimitTracker};

#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub api_calls: AtomicU64,
    pub retries: AtomicU64,
    pub throttle_waits: AtomicU64,
    pub fetches: AtomicU64,
    pub memo_hits: AtomicU64,
    pub revalidated: AtomicU64,
    pub misses: AtomicU64,
    pub cache_errors: AtomicU64,
}

impl RunCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Definition cache activity during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Served from the in-run memo without any request
    pub memo_hits: u64,
    /// Conditional request answered 304
    pub revalidated: u64,
    /// Full download
    pub misses: u64,
    pub errors: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.memo_hits + self.revalidated
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub api_calls: u64,
    pub retries: u64,
    pub throttle_waits: u64,
    pub definition_fetches: u64,
    pub cache: CacheStats,
    pub rate_limit: RateLimitState,
}

pub struct RunContext {
    rate_limits: RateLimitTracker,
    pub(crate) definitions: DashMap<String, Arc<FolderDefinition>>,
    pub(crate) url_checks: DashMap<String, Result<(), ValidationError>>,
    pub(crate) counters: RunCounters,
    cache: Arc<DefinitionCache>,
}

impl RunContext {
    pub fn new(config: &SyncConfig, cache: Arc<DefinitionCache>) -> Arc<Self> {
        Arc::new(Self {
            rate_limits: RateLimitTracker::new(config.rate_limit_warn_ratio, config.rate_limit_critical_ratio),
            definitions: DashMap::new(),
            url_checks: DashMap::new(),
            counters: RunCounters::default(),
            cache,
        })
    }

    #[must_use]
    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DefinitionCache> {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> RunStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        RunStats {
            api_calls: load(&c.api_calls),
            retries: load(&c.retries),
            throttle_waits: load(&c.throttle_waits),
            definition_fetches: load(&c.fetches),
            cache: CacheStats {
                memo_hits: load(&c.memo_hits),
                revalidated: load(&c.revalidated),
                misses: load(&c.misses),
                errors: load(&c.cache_errors),
            },
            rate_limit: self.rate_limits.snapshot(),
        }
    }

    /// Drop per-run memos and return the final counters.
    pub fn finish(&self) -> RunStats {
        self.definitions.clear();
        self.url_checks.clear();
        self.stats()
    }
}
