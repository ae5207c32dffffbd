// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Execution strategy for rule pushes.
//!
//! Small pushes go out as one call on the caller's task; anything larger is
//! split into fixed-size batches and fanned out to a bounded pool.
//!
//! # Example
//!
//! ```
//! use ctrld_sync::batching::{ExecutionPolicy, Strategy};
//!
//! let policy = ExecutionPolicy { inline_threshold: 500, batch_size: 500, workers: 3 };
//! assert_eq!(policy.choose(500), Strategy::Inline);
//! assert_eq!(policy.choose(1200), Strategy::Pooled { batches: 3 });
//! ```

/// How a push of `n` hostnames is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing left to send
    Skip,
    /// One synchronous call
    Inline,
    /// Fixed-size batches on a bounded worker pool
    Pooled { batches: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// At or below this many hostnames, skip the pool
    pub inline_threshold: usize,
    /// Hostnames per create-rules call
    pub batch_size: usize,
    /// Concurrent batches
    pub workers: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            inline_threshold: 500,
            batch_size: 500,
            workers: 3,
        }
    }
}

impl ExecutionPolicy {
    #[must_use]
    pub fn choose(&self, n: usize) -> Strategy {
        match n {
            0 => Strategy::Skip,
            n if n <= self.inline_threshold.min(self.batch_size.max(1)) => Strategy::Inline,
            n => Strategy::Pooled { batches: n.div_ceil(self.batch_size.max(1)) },
        }
    }
}

/// Split `items` into consecutive chunks of at most `batch_size`.
#[must_use]
pub fn split_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items.chunks(batch_size.max(1)).map(<[T]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.choose(0), Strategy::Skip);
        assert_eq!(policy.choose(1), Strategy::Inline);
        assert_eq!(policy.choose(500), Strategy::Inline);
        assert_eq!(policy.choose(501), Strategy::Pooled { batches: 2 });
    }

    #[test]
    fn test_inline_never_exceeds_batch_size() {
        let policy = ExecutionPolicy { inline_threshold: 1000, batch_size: 100, workers: 2 };
        assert_eq!(policy.choose(100), Strategy::Inline);
        assert_eq!(policy.choose(101), Strategy::Pooled { batches: 2 });
    }

    #[test]
    fn test_split_batches() {
        let items: Vec<u32> = (0..1200).collect();
        let batches = split_batches(&items, 500);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(batches.concat(), items);
        assert!(split_batches::<u32>(&[], 500).is_empty());
    }
}
