// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dry-run example.
//!
//! Demonstrates:
//! 1. Wiring a `Reconciler` to the live API with a bearer token
//! 2. Fetching and validating folder definitions (nothing is changed remotely)
//! 3. Printing the plan as JSON
//! 4. Reading run statistics
//!
//! # Run
//!
//! ```bash
//! CTRLD_TOKEN=... cargo run --example dry_run -- <profile> <url> [<url> ...]
//! ```

use ctrld_sync::{ApiToken, Reconciler, RunMode, SyncConfig, SyncRequest};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let Some(profile) = args.next() else {
        eprintln!("usage: dry_run <profile> <url> [<url> ...]");
        std::process::exit(2);
    };
    let urls: Vec<String> = args.collect();

    let token = ApiToken::new(std::env::var("CTRLD_TOKEN").unwrap_or_default());
    let reconciler = Reconciler::connect(SyncConfig::default(), &token)?;

    let report = reconciler
        .run(SyncRequest {
            profiles: vec![profile],
            urls,
            mode: RunMode { dry_run: true, no_delete: false },
        })
        .await;

    println!("{}", serde_json::to_string_pretty(&report.plan)?);
    println!(
        "definition fetches: {}, cache hits: {}, misses: {}",
        report.stats.definition_fetches,
        report.stats.cache.hits(),
        report.stats.cache.misses
    );

    std::process::exit(report.exit_code());
}
