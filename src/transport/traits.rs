// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// One REST call, relative to the API base. `path` always starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub operation: &'static str,
    pub method: Method,
    pub path: String,
    /// Form-encoded body fields, in order. Empty for GET/DELETE.
    pub form: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(operation: &'static str, path: impl Into<String>) -> Self {
        Self { operation, method: Method::Get, path: path.into(), form: Vec::new() }
    }

    pub fn delete(operation: &'static str, path: impl Into<String>) -> Self {
        Self { operation, method: Method::Delete, path: path.into(), form: Vec::new() }
    }

    pub fn post(operation: &'static str, path: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self { operation, method: Method::Post, path: path.into(), form }
    }

    /// `METHOD /path`, used in logs and error messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

/// Response with lower-cased header names.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Carries the bearer credential; implementors must keep it out of errors.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Cache validators from a previous fetch of the same URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Incremental body reader so callers can stop at a size ceiling.
#[async_trait]
pub trait ChunkReader: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

pub struct SourceResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Box<dyn ChunkReader>,
}

impl SourceResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.header("etag").map(str::to_string),
            last_modified: self.header("last-modified").map(str::to_string),
        }
    }
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Unauthenticated GET of a remote definition document, sending
/// `If-None-Match` / `If-Modified-Since` from `validators` when present.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn open(&self, url: &str, validators: &Validators) -> Result<SourceResponse, TransportError>;
}
