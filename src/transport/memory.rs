// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory stand-ins for the remote service and the document host.
//!
//! [`MemoryApi`] keeps folders and rules per profile, answers the REST
//! surface with the same JSON shapes as the real service and records every
//! attempt with a tokio timestamp, so tests on paused time can assert
//! ordering and gaps. Faults are scripted per method and path prefix.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::traits::{ApiRequest, ApiResponse, ApiTransport, ChunkReader, DocumentSource, Method, SourceResponse, Validators};
use crate::error::TransportError;
use crate::model::RemoteFolder;

const CHUNK_SIZE: usize = 16 * 1024;

/// One attempt as seen by the fake service.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub at: Instant,
    pub method: Method,
    pub path: String,
    pub form: Vec<(String, String)>,
    /// `None` when a transport fault was injected.
    pub status: Option<u16>,
}

impl CallRecord {
    /// Values of `hostnames[i]` fields, in order.
    #[must_use]
    pub fn hostnames(&self) -> Vec<String> {
        self.form
            .iter()
            .filter(|(k, _)| k.starts_with("hostnames["))
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FaultKind {
    Status { status: u16, retry_after: Option<u64> },
    Timeout,
}

#[derive(Debug, Clone)]
struct Fault {
    method: Method,
    path_prefix: String,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct FolderData {
    id: String,
    name: String,
    action: String,
    status: String,
    rules: Vec<String>,
    hidden_polls: u32,
}

#[derive(Debug, Default)]
struct ProfileData {
    folders: Vec<FolderData>,
    root_rules: BTreeSet<String>,
}

#[derive(Debug)]
struct RateLimitScript {
    limit: u64,
    remaining: u64,
    reset: u64,
}

#[derive(Debug, Default)]
struct FakeState {
    profiles: HashMap<String, ProfileData>,
    denied: HashMap<String, u16>,
    faults: Vec<Fault>,
    next_id: u64,
    omit_created_id: bool,
    hide_new_folders_for: u32,
    rate_limit: Option<RateLimitScript>,
}

/// Stateful fake of the profile REST API.
#[derive(Default)]
pub struct MemoryApi {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<CallRecord>>,
}

impl MemoryApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a folder with rules. Returns its id.
    pub fn seed_folder(&self, profile: &str, name: &str, rules: &[&str]) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("seed{}", state.next_id);
        state.profiles.entry(profile.to_string()).or_default().folders.push(FolderData {
            id: id.clone(),
            name: name.to_string(),
            action: "0".into(),
            status: "1".into(),
            rules: rules.iter().map(|r| r.to_string()).collect(),
            hidden_polls: 0,
        });
        id
    }

    pub fn seed_root_rules(&self, profile: &str, rules: &[&str]) {
        let mut state = self.state.lock();
        let root = &mut state.profiles.entry(profile.to_string()).or_default().root_rules;
        root.extend(rules.iter().map(|r| r.to_string()));
    }

    /// Every request for `profile` answers with `status`.
    pub fn deny(&self, profile: &str, status: u16) {
        self.state.lock().denied.insert(profile.to_string(), status);
    }

    /// Fail the next `times` requests matching method and path prefix.
    pub fn fail_next(&self, method: Method, path_prefix: &str, kind: FaultKind, times: u32) {
        self.state.lock().faults.push(Fault {
            method,
            path_prefix: path_prefix.to_string(),
            kind,
            remaining: times,
        });
    }

    /// Create-folder responses carry no id; the caller has to poll.
    pub fn omit_created_id(&self, omit: bool) {
        self.state.lock().omit_created_id = omit;
    }

    /// New folders stay out of listings for the next `polls` folder listings.
    pub fn hide_new_folders_for(&self, polls: u32) {
        self.state.lock().hide_new_folders_for = polls;
    }

    /// Attach `X-RateLimit-*` headers; `remaining` drops by one per request.
    pub fn with_rate_limit(&self, limit: u64, remaining: u64, reset: u64) {
        self.state.lock().rate_limit = Some(RateLimitScript { limit, remaining, reset });
    }

    #[must_use]
    pub fn folders(&self, profile: &str) -> Vec<RemoteFolder> {
        let state = self.state.lock();
        state
            .profiles
            .get(profile)
            .map(|p| {
                p.folders
                    .iter()
                    .map(|f| RemoteFolder { id: f.id.clone(), name: f.name.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rules of the first folder named `name`.
    #[must_use]
    pub fn folder_rules(&self, profile: &str, name: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .profiles
            .get(profile)
            .and_then(|p| p.folders.iter().find(|f| f.name == name))
            .map(|f| f.rules.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_matching(&self, method: Method, path_prefix: &str) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method && c.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, request: &ApiRequest, status: Option<u16>) {
        self.calls.lock().push(CallRecord {
            at: Instant::now(),
            method: request.method,
            path: request.path.clone(),
            form: request.form.clone(),
            status,
        });
    }

    fn take_fault(state: &mut FakeState, request: &ApiRequest) -> Option<FaultKind> {
        let fault = state.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.method == request.method && request.path.starts_with(&f.path_prefix)
        })?;
        fault.remaining -= 1;
        Some(fault.kind)
    }

    fn respond(state: &mut FakeState, request: &ApiRequest) -> (u16, Value, HashMap<String, String>) {
        let mut headers = HashMap::new();
        if let Some(script) = state.rate_limit.as_mut() {
            script.remaining = script.remaining.saturating_sub(1);
            headers.insert("x-ratelimit-limit".into(), script.limit.to_string());
            headers.insert("x-ratelimit-remaining".into(), script.remaining.to_string());
            headers.insert("x-ratelimit-reset".into(), script.reset.to_string());
        }

        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        let Some((profile, rest)) = segments.split_first() else {
            return (404, json!({"error": "not found"}), headers);
        };
        let profile = profile.to_string();

        if let Some(status) = state.denied.get(&profile) {
            return (*status, json!({"error": {"message": "denied"}}), headers);
        }

        let omit_created_id = state.omit_created_id;
        let hide_for = state.hide_new_folders_for;
        state.next_id += 1;
        let fresh_id = format!("fld{}", state.next_id);
        let data = state.profiles.entry(profile).or_default();

        let (status, body) = match (request.method, rest) {
            (Method::Get, ["groups"]) => {
                let mut groups = Vec::new();
                for folder in data.folders.iter_mut() {
                    if folder.hidden_polls > 0 {
                        folder.hidden_polls -= 1;
                        continue;
                    }
                    groups.push(json!({
                        "PK": folder.id,
                        "group": folder.name,
                        "action": {"do": folder.action, "status": folder.status},
                    }));
                }
                (200, json!({"body": {"groups": groups}}))
            }
            (Method::Delete, ["groups", id]) => {
                let before = data.folders.len();
                data.folders.retain(|f| f.id != *id);
                if data.folders.len() < before {
                    (200, json!({"success": true}))
                } else {
                    (404, json!({"error": {"message": "folder not found"}}))
                }
            }
            (Method::Post, ["groups"]) => {
                let field = |k: &str| request.form.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
                let name = field("name").unwrap_or_default();
                data.folders.push(FolderData {
                    id: fresh_id.clone(),
                    name: name.clone(),
                    action: field("do").unwrap_or_else(|| "0".into()),
                    status: field("status").unwrap_or_else(|| "1".into()),
                    rules: Vec::new(),
                    hidden_polls: hide_for,
                });
                if omit_created_id {
                    (200, json!({"body": {}}))
                } else {
                    (200, json!({"body": {"groups": [{"PK": fresh_id, "group": name}]}}))
                }
            }
            (Method::Get, ["rules"]) => {
                let rules: Vec<Value> = data.root_rules.iter().map(|r| json!({"PK": r})).collect();
                (200, json!({"body": {"rules": rules}}))
            }
            (Method::Get, ["rules", id]) => match data.folders.iter().find(|f| f.id == *id) {
                Some(folder) => {
                    let rules: Vec<Value> = folder.rules.iter().map(|r| json!({"PK": r})).collect();
                    (200, json!({"body": {"rules": rules}}))
                }
                None => (404, json!({"error": {"message": "folder not found"}})),
            },
            (Method::Post, ["rules"]) => {
                let group = request.form.iter().find(|(k, _)| k == "group").map(|(_, v)| v.clone());
                let hostnames = request
                    .form
                    .iter()
                    .filter(|(k, _)| k.starts_with("hostnames["))
                    .map(|(_, v)| v.clone());
                match group {
                    Some(id) => match data.folders.iter_mut().find(|f| f.id == id) {
                        Some(folder) => {
                            folder.rules.extend(hostnames);
                            (200, json!({"body": {}}))
                        }
                        None => (404, json!({"error": {"message": "folder not found"}})),
                    },
                    None => {
                        data.root_rules.extend(hostnames);
                        (200, json!({"body": {}}))
                    }
                }
            }
            _ => (404, json!({"error": {"message": "no such endpoint"}})),
        };

        (status, body, headers)
    }
}

#[async_trait]
impl ApiTransport for MemoryApi {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            match Self::take_fault(&mut state, request) {
                Some(FaultKind::Timeout) => Err(TransportError::Timeout("injected timeout".into())),
                Some(FaultKind::Status { status, retry_after }) => {
                    let mut headers = HashMap::new();
                    if let Some(secs) = retry_after {
                        headers.insert("retry-after".to_string(), secs.to_string());
                    }
                    let body = json!({"error": {"message": "injected fault"}});
                    Ok(ApiResponse { status, headers, body: body.to_string().into_bytes() })
                }
                None => {
                    let (status, body, headers) = Self::respond(&mut state, request);
                    Ok(ApiResponse { status, headers, body: body.to_string().into_bytes() })
                }
            }
        };

        self.record(request, outcome.as_ref().ok().map(|r| r.status));
        outcome
    }
}

#[derive(Debug, Clone)]
struct HostedDocument {
    body: Vec<u8>,
    etag: String,
    content_type: String,
    send_length: bool,
}

/// Document host with ETag revalidation. Counts every `open`.
#[derive(Default)]
pub struct MemorySource {
    documents: DashMap<String, HostedDocument>,
    statuses: DashMap<String, u16>,
    versions: AtomicUsize,
    opens: AtomicUsize,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `document` as JSON under a fresh ETag.
    pub fn insert(&self, url: &str, document: &Value) {
        self.insert_raw(url, document.to_string().into_bytes(), "application/json");
    }

    pub fn insert_raw(&self, url: &str, body: Vec<u8>, content_type: &str) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        self.documents.insert(
            url.to_string(),
            HostedDocument {
                body,
                etag: format!("\"v{version}\""),
                content_type: content_type.to_string(),
                send_length: true,
            },
        );
    }

    /// Stop sending `Content-Length` for `url`, forcing the streaming check.
    pub fn omit_length(&self, url: &str) {
        if let Some(mut doc) = self.documents.get_mut(url) {
            doc.send_length = false;
        }
    }

    /// Answer every open of `url` with a bare status.
    pub fn set_status(&self, url: &str, status: u16) {
        self.statuses.insert(url.to_string(), status);
    }

    pub fn clear_status(&self, url: &str) {
        self.statuses.remove(url);
    }

    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct VecChunks {
    chunks: std::vec::IntoIter<Vec<u8>>,
}

#[async_trait]
impl ChunkReader for VecChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.chunks.next())
    }
}

fn empty_body() -> Box<dyn ChunkReader> {
    Box::new(VecChunks { chunks: Vec::new().into_iter() })
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn open(&self, url: &str, validators: &Validators) -> Result<SourceResponse, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = self.statuses.get(url) {
            return Ok(SourceResponse { status: *status, headers: HashMap::new(), body: empty_body() });
        }

        let Some(doc) = self.documents.get(url).map(|d| d.clone()) else {
            return Ok(SourceResponse { status: 404, headers: HashMap::new(), body: empty_body() });
        };

        let mut headers = HashMap::new();
        headers.insert("etag".to_string(), doc.etag.clone());

        if validators.etag.as_deref() == Some(doc.etag.as_str()) {
            return Ok(SourceResponse { status: 304, headers, body: empty_body() });
        }

        headers.insert("content-type".to_string(), doc.content_type.clone());
        if doc.send_length {
            headers.insert("content-length".to_string(), doc.body.len().to_string());
        }
        let chunks: Vec<Vec<u8>> = doc.body.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();

        Ok(SourceResponse {
            status: 200,
            headers,
            body: Box::new(VecChunks { chunks: chunks.into_iter() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(resp: &ApiResponse) -> Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[tokio::test]
    async fn test_create_list_delete_folder() {
        let api = MemoryApi::new();
        let form = vec![("name".to_string(), "Ads".to_string()), ("do".into(), "0".into()), ("status".into(), "1".into())];
        let created = api.send(&ApiRequest::post("create_folder", "/p1/groups", form)).await.unwrap();
        assert_eq!(created.status, 200);
        let id = body(&created)["body"]["groups"][0]["PK"].as_str().unwrap().to_string();

        let listed = api.send(&ApiRequest::get("list_folders", "/p1/groups")).await.unwrap();
        assert_eq!(body(&listed)["body"]["groups"][0]["group"], "Ads");

        let deleted = api.send(&ApiRequest::delete("delete_folder", format!("/p1/groups/{id}"))).await.unwrap();
        assert_eq!(deleted.status, 200);
        assert!(api.folders("p1").is_empty());
        assert_eq!(api.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_push_rules_into_folder() {
        let api = MemoryApi::new();
        let id = api.seed_folder("p1", "Ads", &[]);
        let form = vec![
            ("do".to_string(), "0".to_string()),
            ("status".into(), "1".into()),
            ("group".into(), id.clone()),
            ("hostnames[0]".into(), "a.com".into()),
            ("hostnames[1]".into(), "b.com".into()),
        ];
        api.send(&ApiRequest::post("create_rules", "/p1/rules", form)).await.unwrap();
        assert_eq!(api.folder_rules("p1", "Ads"), vec!["a.com", "b.com"]);
        assert_eq!(api.calls()[0].hostnames(), vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_faults_are_consumed() {
        let api = MemoryApi::new();
        api.fail_next(Method::Get, "/p1/rules", FaultKind::Status { status: 503, retry_after: None }, 2);

        let req = ApiRequest::get("list_rules", "/p1/rules");
        assert_eq!(api.send(&req).await.unwrap().status, 503);
        assert_eq!(api.send(&req).await.unwrap().status, 503);
        assert_eq!(api.send(&req).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_hidden_folder_appears_after_polls() {
        let api = MemoryApi::new();
        api.hide_new_folders_for(1);
        api.omit_created_id(true);
        let form = vec![("name".to_string(), "Late".to_string())];
        api.send(&ApiRequest::post("create_folder", "/p1/groups", form)).await.unwrap();

        let first = api.send(&ApiRequest::get("list_folders", "/p1/groups")).await.unwrap();
        assert_eq!(body(&first)["body"]["groups"].as_array().unwrap().len(), 0);
        let second = api.send(&ApiRequest::get("list_folders", "/p1/groups")).await.unwrap();
        assert_eq!(body(&second)["body"]["groups"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_source_revalidates_with_etag() {
        let source = MemorySource::new();
        source.insert("https://lists.example.com/a.json", &json!({"group": {"group": "A"}}));

        let first = source.open("https://lists.example.com/a.json", &Validators::default()).await.unwrap();
        assert_eq!(first.status, 200);
        let validators = first.validators();

        let second = source.open("https://lists.example.com/a.json", &validators).await.unwrap();
        assert_eq!(second.status, 304);
        assert_eq!(source.opens(), 2);
    }
}
