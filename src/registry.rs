// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Existing-rule registry.
//!
//! The set of hostnames already present remotely for one profile during one
//! run. It only grows: there is no removal API, so a member once added stays
//! until the registry is dropped at the end of the profile.
//!
//! # Write ordering
//!
//! Every write takes the single write lock, and [`RuleRegistry::extend`]
//! inserts a whole batch under one guard, so readers observe either none or
//! all of a batch. Membership reads take the shared lock and never wait on
//! each other. A reader racing a writer can miss a hostname being added at
//! that moment; the cost is one duplicate submission, never a lost entry.

use std::collections::HashSet;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashSet<String>>,
}

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, hostname: &str) -> bool {
        self.rules.read().contains(hostname)
    }

    /// Insert every hostname under one write guard. Returns how many were new.
    pub fn extend<I, S>(&self, hostnames: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.extend(hostnames.into_iter().map(Into::into));
        let added = rules.len() - before;
        crate::metrics::set_registry_size(rules.len());
        added
    }

    /// Hostnames from `candidates` not yet present, in input order.
    #[must_use]
    pub fn filter_missing<'a>(&self, candidates: &'a [String]) -> Vec<&'a String> {
        let rules = self.rules.read();
        candidates.iter().filter(|h| !rules.contains(h.as_str())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Sorted copy of the members.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut rules: Vec<String> = self.rules.read().iter().cloned().collect();
        rules.sort_unstable();
        rules
    }
}

impl<S: Into<String>> FromIterator<S> for RuleRegistry {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let registry = Self::new();
        registry.extend(iter);
        registry
    }
}
