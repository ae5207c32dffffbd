// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rule transmission: execution policy and the batch pusher.

pub mod pusher;
pub mod strategy;

pub use pusher::{BatchPusher, PushSummary};
pub use strategy::{split_batches, ExecutionPolicy, Strategy};
