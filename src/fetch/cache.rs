// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Definition cache with HTTP validators.
//!
//! Each URL maps to one immutable [`CacheEntry`] behind an `Arc`. A changed
//! document swaps in a whole new entry, so the body and the validators that
//! describe it are always published together.
//!
//! # Flow
//!
//! ```text
//! fetch(url)
//!       │
//!       ▼
//! ┌─────────────────────────────┐
//! │  lookup entry               │
//! │  send If-None-Match /       │
//! │       If-Modified-Since     │
//! └─────────────────────────────┘
//!       │
//!       ├─→ 304 → mark_validated, reuse cached document
//!       │
//!       └─→ 2xx → replace (document + validators in one swap)
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::Value;

use crate::transport::Validators;

/// Cached remote document.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub url: String,
    pub validators: Validators,
    pub document: Arc<Value>,
    /// Unix seconds of the last full download
    pub fetched_at: u64,
    /// Unix seconds of the last 304 (or download)
    pub last_validated: u64,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// URL → cached document, shared across runs.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    entries: DashMap<String, Arc<CacheEntry>>,
}

impl DefinitionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, url: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(url).map(|e| Arc::clone(e.value()))
    }

    /// Publish a freshly downloaded document.
    pub fn replace(&self, url: &str, validators: Validators, document: Value) -> Arc<CacheEntry> {
        let now = unix_now();
        let entry = Arc::new(CacheEntry {
            url: url.to_string(),
            validators,
            document: Arc::new(document),
            fetched_at: now,
            last_validated: now,
        });
        self.entries.insert(url.to_string(), Arc::clone(&entry));
        entry
    }

    /// Record a 304 for `url`. The document and validators stay as they are.
    pub fn mark_validated(&self, url: &str) -> Option<Arc<CacheEntry>> {
        let mut slot = self.entries.get_mut(url)?;
        let refreshed = Arc::new(CacheEntry {
            last_validated: unix_now(),
            ..CacheEntry::clone(slot.value())
        });
        *slot = Arc::clone(&refreshed);
        Some(refreshed)
    }

    /// Insert a previously persisted entry as-is.
    pub fn restore(&self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), Arc::new(entry));
    }

    pub fn remove(&self, url: &str) {
        self.entries.remove(url);
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
