// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient API client.
//!
//! [`ApiClient::execute`] wraps one REST call with:
//! - proactive throttling when the tracked rate-limit window is nearly spent
//! - retries for transport errors, 5xx and 429 (jittered exponential backoff,
//!   or the exact `Retry-After` when the server sends one)
//! - rate-limit header tracking on every response
//!
//! Any other 4xx is returned immediately as [`ApiError::Fatal`].
//!
//! The typed operations below decode the service's `{"body": {...}}`
//! envelopes leniently: unknown fields are ignored and `PK` may be a string
//! or a number.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::{RunContext, RunCounters};
use crate::error::ApiError;
use crate::model::{RemoteFolder, RuleAction};
use crate::resilience::rate_limit::parse_retry_after;
use crate::resilience::retry::{retry, RetryConfig};
use crate::sanitize::sanitize_for_log;
use crate::transport::{ApiRequest, ApiResponse, ApiTransport};
use crate::validation::is_valid_folder_id;

/// Longest response excerpt carried in a fatal error.
const DETAIL_LIMIT: usize = 200;

struct ClientInner {
    transport: Arc<dyn ApiTransport>,
    ctx: Arc<RunContext>,
    retry: RetryConfig,
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn ApiTransport>, ctx: Arc<RunContext>, retry: RetryConfig) -> Self {
        Self { inner: Arc::new(ClientInner { transport, ctx, retry }) }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<RunContext> {
        &self.inner.ctx
    }

    /// Execute `request` with throttling and retries. Returns the 2xx response.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let inner = &self.inner;
        retry(request.operation, &inner.retry, |attempt| async move {
            inner.throttle().await;

            let counters = &inner.ctx.counters;
            RunCounters::bump(&counters.api_calls);
            if attempt > 0 {
                RunCounters::bump(&counters.retries);
            }

            let response = match inner.transport.send(request).await {
                Ok(response) => response,
                Err(source) => {
                    crate::metrics::record_api_call(request.operation, None);
                    return Err(ApiError::Transport { operation: request.label(), attempts: attempt + 1, source });
                }
            };

            inner.ctx.rate_limits().observe(&response.headers);
            crate::metrics::record_api_call(request.operation, Some(response.status));
            classify(request, response).map_err(|e| e.with_attempts(attempt + 1))
        })
        .await
    }

    /// `GET /{profile}/groups`. Doubles as the access check: a 401/403/404
    /// here means the token or profile is unusable.
    #[tracing::instrument(skip(self))]
    pub async fn list_folders(&self, profile: &str) -> Result<Vec<RemoteFolder>, ApiError> {
        let request = ApiRequest::get("list_folders", format!("/{profile}/groups"));
        let body = self.execute_json(&request).await?;

        let groups = body
            .pointer("/body/groups")
            .and_then(Value::as_array)
            .ok_or_else(|| decode_error(&request, "expected body.groups list"))?;

        let mut folders = Vec::with_capacity(groups.len());
        for group in groups {
            let (Some(id), Some(name)) = (pk(group), group.get("group").and_then(Value::as_str)) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if !is_valid_folder_id(&id) {
                warn!(profile, folder_id = %sanitize_for_log(&id), "Skipping folder with invalid id");
                continue;
            }
            folders.push(RemoteFolder { id, name: name.to_string() });
        }
        debug!(profile, count = folders.len(), "Listed folders");
        Ok(folders)
    }

    pub async fn delete_folder(&self, profile: &str, folder_id: &str) -> Result<(), ApiError> {
        let request = ApiRequest::delete("delete_folder", format!("/{profile}/groups/{folder_id}"));
        self.execute(&request).await.map(|_| ())
    }

    /// `POST /{profile}/groups`. Returns the new id when the response carries
    /// one; `None` means the caller has to discover it by listing.
    #[tracing::instrument(skip(self))]
    pub async fn create_folder(
        &self,
        profile: &str,
        name: &str,
        action: RuleAction,
        enabled: bool,
    ) -> Result<Option<String>, ApiError> {
        let form = vec![
            ("name".to_string(), name.to_string()),
            ("do".to_string(), action.wire().to_string()),
            ("status".to_string(), u8::from(enabled).to_string()),
        ];
        let request = ApiRequest::post("create_folder", format!("/{profile}/groups"), form);
        let body = self.execute_json(&request).await?;

        let id = body.pointer("/body/group").and_then(pk).or_else(|| {
            body.pointer("/body/groups")
                .and_then(Value::as_array)?
                .iter()
                .find(|g| g.get("group").and_then(Value::as_str).map(str::trim) == Some(name.trim()))
                .and_then(pk)
        });

        match id {
            Some(id) if is_valid_folder_id(&id) => {
                info!(profile, folder = %sanitize_for_log(name), folder_id = %id, "Created folder");
                Ok(Some(id))
            }
            Some(id) => Err(decode_error(&request, &format!("invalid folder id {}", sanitize_for_log(&id)))),
            None => Ok(None),
        }
    }

    /// `GET /{profile}/rules` for the root, `/{profile}/rules/{id}` for a folder.
    pub async fn list_rules(&self, profile: &str, folder_id: Option<&str>) -> Result<Vec<String>, ApiError> {
        let path = match folder_id {
            Some(id) => format!("/{profile}/rules/{id}"),
            None => format!("/{profile}/rules"),
        };
        let request = ApiRequest::get("list_rules", path);
        let body = self.execute_json(&request).await?;

        let rules = body
            .pointer("/body/rules")
            .and_then(Value::as_array)
            .map(|rules| rules.iter().filter_map(pk).filter(|r| !r.is_empty()).collect())
            .unwrap_or_default();
        Ok(rules)
    }

    /// `POST /{profile}/rules` with `hostnames[i]` form fields.
    pub async fn create_rules(
        &self,
        profile: &str,
        folder_id: &str,
        action: RuleAction,
        enabled: bool,
        hostnames: &[String],
    ) -> Result<(), ApiError> {
        let mut form = Vec::with_capacity(hostnames.len() + 3);
        form.push(("do".to_string(), action.wire().to_string()));
        form.push(("status".to_string(), u8::from(enabled).to_string()));
        form.push(("group".to_string(), folder_id.to_string()));
        form.extend(hostnames.iter().enumerate().map(|(i, h)| (format!("hostnames[{i}]"), h.clone())));

        let request = ApiRequest::post("create_rules", format!("/{profile}/rules"), form);
        self.execute(&request).await.map(|_| ())
    }

    async fn execute_json(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let response = self.execute(request).await?;
        serde_json::from_slice(&response.body).map_err(|e| decode_error(request, &e.to_string()))
    }
}

impl ClientInner {
    /// Wait for the window reset when remaining capacity is critical.
    async fn throttle(&self) {
        let cap = self.retry.max_throttle_wait;
        if let Some(wait) = self.ctx.rate_limits().throttle_delay_now(cap) {
            let state = self.ctx.rate_limits().hint();
            warn!(
                remaining = state.remaining,
                limit = state.limit,
                wait_ms = wait.as_millis() as u64,
                "Rate limit nearly exhausted, pausing until reset"
            );
            RunCounters::bump(&self.ctx.counters.throttle_waits);
            crate::metrics::record_throttle(wait);
            sleep(wait).await;
        }
    }
}

fn classify(request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse, ApiError> {
    match response.status {
        200..=299 => Ok(response),
        429 => Err(ApiError::RateLimited {
            operation: request.label(),
            attempts: 0,
            retry_after: parse_retry_after(&response.headers),
        }),
        status @ 500..=599 => Err(ApiError::Server { operation: request.label(), status, attempts: 0 }),
        status => Err(ApiError::Fatal { operation: request.label(), status, detail: error_detail(&response.body) }),
    }
}

/// `error.message` from a JSON error body, else a truncated raw excerpt.
fn error_detail(body: &[u8]) -> String {
    let message = serde_json::from_slice::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let text = message.unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(DETAIL_LIMIT).collect());
    sanitize_for_log(&text)
}

fn decode_error(request: &ApiRequest, detail: &str) -> ApiError {
    ApiError::Decode { operation: request.label(), detail: sanitize_for_log(detail) }
}

fn pk(entry: &Value) -> Option<String> {
    match entry.get("PK")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
