// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-backed fetcher for folder definitions.
//!
//! Lookup order for a URL:
//!
//! 1. In-run memo (no request at all)
//! 2. URL guard (memoised per run)
//! 3. Conditional GET with the cached validators
//!    - 304 → reuse the cached document
//!    - 2xx → content-type check, size-capped streaming read, parse,
//!      atomic cache replace
//! 4. Build and validate the [`FolderDefinition`]

pub mod builder;
pub mod cache;
pub mod guard;
pub mod persistence;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::context::{RunContext, RunCounters};
use crate::error::{FetchError, ValidationError};
use crate::model::FolderDefinition;
use crate::sanitize::sanitize_for_log;
use crate::transport::{DocumentSource, SourceResponse, Validators};

pub use cache::{CacheEntry, DefinitionCache};
pub use guard::{HostResolver, SystemResolver, UrlGuard};
pub use persistence::{CachePersistence, LoadReport};

const ALLOWED_CONTENT_TYPES: [&str; 3] = ["application/json", "text/json", "text/plain"];

#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn DocumentSource>,
    guard: UrlGuard,
    ctx: Arc<RunContext>,
    max_bytes: usize,
    workers: usize,
}

impl Fetcher {
    pub fn new(source: Arc<dyn DocumentSource>, guard: UrlGuard, ctx: Arc<RunContext>, config: &SyncConfig) -> Self {
        Self {
            source,
            guard,
            ctx,
            max_bytes: config.max_response_bytes,
            workers: config.fetch_workers.max(1),
        }
    }

    /// Run the URL guard once per URL per run.
    pub async fn validate_url(&self, url: &str) -> Result<(), ValidationError> {
        if let Some(verdict) = self.ctx.url_checks.get(url) {
            return verdict.clone();
        }
        let verdict = self.guard.check(url).await;
        if let Err(e) = &verdict {
            warn!(error = %e, "Skipping unsafe definition url");
        }
        self.ctx.url_checks.insert(url.to_string(), verdict.clone());
        verdict
    }

    #[tracing::instrument(skip(self), fields(url = %sanitize_for_log(url)))]
    pub async fn fetch(&self, url: &str) -> Result<Arc<FolderDefinition>, FetchError> {
        if let Some(definition) = self.ctx.definitions.get(url) {
            RunCounters::bump(&self.ctx.counters.memo_hits);
            crate::metrics::record_cache("memo_hit");
            return Ok(Arc::clone(definition.value()));
        }

        self.validate_url(url).await?;

        let document = self.load_document(url).await?;
        let definition = Arc::new(FolderDefinition::from_document(url, &document)?);
        self.ctx.definitions.insert(url.to_string(), Arc::clone(&definition));
        Ok(definition)
    }

    /// Fetch every URL with at most `fetch_workers` in flight. Results keep
    /// the input order.
    pub async fn fetch_all(&self, urls: &[String]) -> Vec<(String, Result<Arc<FolderDefinition>, FetchError>)> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (idx, url) in urls.iter().enumerate() {
            let fetcher = self.clone();
            let url = url.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = fetcher.fetch(&url).await;
                (idx, url, result)
            });
        }

        let mut results: Vec<Option<(String, Result<Arc<FolderDefinition>, FetchError>)>> =
            (0..urls.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, url, result)) => results[idx] = Some((url, result)),
                Err(e) => warn!(error = %e, "Definition fetch task panicked"),
            }
        }

        results
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    let err = FetchError::Transport {
                        url: sanitize_for_log(url),
                        source: crate::error::TransportError::Io("fetch task aborted".to_string()),
                    };
                    (url.clone(), Err(err))
                })
            })
            .collect()
    }

    async fn load_document(&self, url: &str) -> Result<Arc<Value>, FetchError> {
        let cached = self.ctx.cache().get(url);
        let validators = cached.as_ref().map(|e| e.validators.clone()).unwrap_or_default();

        RunCounters::bump(&self.ctx.counters.fetches);
        let mut response = self.open(url, &validators).await?;

        if response.status == 304 {
            if let Some(entry) = self.ctx.cache().mark_validated(url) {
                debug!("Cached definition still valid");
                RunCounters::bump(&self.ctx.counters.revalidated);
                crate::metrics::record_cache("revalidated");
                return Ok(Arc::clone(&entry.document));
            }
            warn!("Got 304 without a cached copy, refetching");
            RunCounters::bump(&self.ctx.counters.cache_errors);
            crate::metrics::record_cache("error");
            response = self.open(url, &Validators::default()).await?;
        }

        let new_validators = response.validators();
        let document = self.read_json(url, response).await?;
        RunCounters::bump(&self.ctx.counters.misses);
        crate::metrics::record_cache("miss");

        let entry = self.ctx.cache().replace(url, new_validators, document);
        Ok(Arc::clone(&entry.document))
    }

    async fn open(&self, url: &str, validators: &Validators) -> Result<SourceResponse, FetchError> {
        self.source.open(url, validators).await.map_err(|source| FetchError::Transport {
            url: sanitize_for_log(url),
            source,
        })
    }

    async fn read_json(&self, url: &str, mut response: SourceResponse) -> Result<Value, FetchError> {
        let safe_url = || sanitize_for_log(url);

        if !(200..300).contains(&response.status) {
            return Err(FetchError::Status { url: safe_url(), status: response.status });
        }

        let content_type = response.header("content-type").unwrap_or_default().to_ascii_lowercase();
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if !ALLOWED_CONTENT_TYPES.contains(&media_type) {
            return Err(FetchError::ContentType { url: safe_url(), content_type: sanitize_for_log(&content_type) });
        }

        if let Some(raw) = response.header("content-length") {
            match raw.trim().parse::<usize>() {
                Ok(len) if len > self.max_bytes => {
                    return Err(FetchError::TooLarge { url: safe_url(), limit: self.max_bytes });
                }
                Ok(_) => {}
                Err(_) => warn!(content_length = %sanitize_for_log(raw), "Malformed Content-Length, using streaming check"),
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .body
            .next_chunk()
            .await
            .map_err(|source| FetchError::Transport { url: safe_url(), source })?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge { url: safe_url(), limit: self.max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        crate::metrics::record_fetch_bytes(body.len());

        serde_json::from_slice(&body).map_err(|e| FetchError::Json { url: safe_url(), detail: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemorySource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::IpAddr;

    const URL: &str = "https://lists.example.com/ads.json";

    struct PublicResolver;

    #[async_trait]
    impl HostResolver for PublicResolver {
        async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            Ok(vec!["93.184.216.34".parse().unwrap()])
        }
    }

    fn doc() -> Value {
        json!({"group": {"group": "Ads"}, "rules": [{"PK": "a.com"}, {"PK": "b.com"}]})
    }

    fn fetcher(source: Arc<MemorySource>, cache: Arc<DefinitionCache>, config: &SyncConfig) -> Fetcher {
        let ctx = RunContext::new(config, cache);
        Fetcher::new(source, UrlGuard::new(Arc::new(PublicResolver)), ctx, config)
    }

    #[tokio::test]
    async fn test_fetch_builds_definition_and_memoizes() {
        let source = Arc::new(MemorySource::new());
        source.insert(URL, &doc());
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &SyncConfig::default());

        let first = f.fetch(URL).await.unwrap();
        let second = f.fetch(URL).await.unwrap();
        assert_eq!(first.name, "Ads");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.opens(), 1);

        let stats = f.ctx.stats();
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.cache.memo_hits, 1);
    }

    #[tokio::test]
    async fn test_second_run_revalidates_with_304() {
        let source = Arc::new(MemorySource::new());
        source.insert(URL, &doc());
        let cache = Arc::new(DefinitionCache::new());

        let run1 = fetcher(Arc::clone(&source), Arc::clone(&cache), &SyncConfig::default());
        let first = run1.fetch(URL).await.unwrap();
        let cached_doc = Arc::clone(&cache.get(URL).unwrap().document);

        let run2 = fetcher(Arc::clone(&source), Arc::clone(&cache), &SyncConfig::default());
        let second = run2.fetch(URL).await.unwrap();

        assert_eq!(*first, *second);
        assert!(Arc::ptr_eq(&cached_doc, &cache.get(URL).unwrap().document));
        let stats = run2.ctx.stats();
        assert_eq!(stats.cache.revalidated, 1);
        assert_eq!(stats.cache.misses, 0);
        assert_eq!(stats.cache.hits(), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let source = Arc::new(MemorySource::new());
        source.insert(URL, &doc());
        let config = SyncConfig { max_response_bytes: 16, ..Default::default() };
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &config);
        assert!(matches!(f.fetch(URL).await, Err(FetchError::TooLarge { limit: 16, .. })));

        // Without Content-Length the streaming check still trips
        source.omit_length(URL);
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &config);
        assert!(matches!(f.fetch(URL).await, Err(FetchError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_content_type_enforced() {
        let source = Arc::new(MemorySource::new());
        source.insert_raw(URL, b"<html></html>".to_vec(), "text/html; charset=utf-8");
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &SyncConfig::default());
        assert!(matches!(f.fetch(URL).await, Err(FetchError::ContentType { .. })));

        source.insert_raw(URL, doc().to_string().into_bytes(), "text/plain; charset=utf-8");
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &SyncConfig::default());
        assert!(f.fetch(URL).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_status_and_bad_json() {
        let source = Arc::new(MemorySource::new());
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &SyncConfig::default());
        assert!(matches!(f.fetch(URL).await, Err(FetchError::Status { status: 404, .. })));

        source.insert_raw(URL, b"{oops".to_vec(), "application/json");
        assert!(matches!(f.fetch(URL).await, Err(FetchError::Json { .. })));
    }

    #[tokio::test]
    async fn test_unsafe_url_never_opened() {
        let source = Arc::new(MemorySource::new());
        let f = fetcher(Arc::clone(&source), Arc::new(DefinitionCache::new()), &SyncConfig::default());
        let err = f.fetch("http://lists.example.com/ads.json").await.unwrap_err();
        assert!(matches!(err, FetchError::Validation(ValidationError::Url { .. })));
        assert_eq!(source.opens(), 0);
    }

    #[tokio::test]
    async fn test_fetch_all_keeps_order() {
        let source = Arc::new(MemorySource::new());
        let urls: Vec<String> = (0..5).map(|i| format!("https://lists.example.com/{i}.json")).collect();
        for (i, url) in urls.iter().enumerate() {
            source.insert(url, &json!({"group": {"group": format!("F{i}")}, "rules": []}));
        }
        let f = fetcher(source, Arc::new(DefinitionCache::new()), &SyncConfig { fetch_workers: 2, ..Default::default() });

        let results = f.fetch_all(&urls).await;
        let names: Vec<String> = results.iter().map(|(_, r)| r.as_ref().unwrap().name.clone()).collect();
        assert_eq!(names, vec!["F0", "F1", "F2", "F3", "F4"]);
    }
}
