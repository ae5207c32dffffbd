// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `reqwest` implementation of both transport seams.
//!
//! Two clients are kept: the API client sends the bearer token, the document
//! client sends nothing but the User-Agent. Neither follows redirects, so a
//! vetted definition URL cannot bounce the fetch to another host.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;

use super::traits::{ApiRequest, ApiResponse, ApiTransport, ChunkReader, DocumentSource, Method, SourceResponse, Validators};
use crate::config::SyncConfig;
use crate::error::TransportError;
use crate::sanitize::{ApiToken, Redactor};

pub struct HttpTransport {
    api: Client,
    documents: Client,
    base: String,
    redactor: Redactor,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig, token: &ApiToken) -> Result<Self, TransportError> {
        let redactor = Redactor::new(token);

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|_| TransportError::Io("api token contains invalid header characters".to_string()))?;
        auth.set_sensitive(true);

        let mut api_headers = HeaderMap::new();
        api_headers.insert(AUTHORIZATION, auth);
        api_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let api = Client::builder()
            .default_headers(api_headers)
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .redirect(Policy::none())
            .build()
            .map_err(|e| TransportError::Io(redactor.sanitize(&e.to_string())))?;

        let documents = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .redirect(Policy::none())
            .build()
            .map_err(|e| TransportError::Io(redactor.sanitize(&e.to_string())))?;

        Ok(Self {
            api,
            documents,
            base: config.api_base.trim_end_matches('/').to_string(),
            redactor,
        })
    }

    fn map_error(&self, err: &reqwest::Error) -> TransportError {
        let msg = self.redactor.sanitize(&err.to_string());
        if err.is_timeout() {
            TransportError::Timeout(msg)
        } else if err.is_connect() {
            TransportError::Connect(msg)
        } else {
            TransportError::Io(msg)
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base, request.path);
        let builder = match request.method {
            Method::Get => self.api.get(&url),
            Method::Delete => self.api.delete(&url),
            Method::Post => self.api.post(&url).form(&request.form),
        };

        let response = builder.send().await.map_err(|e| self.map_error(&e))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await.map_err(|e| self.map_error(&e))?.to_vec();

        Ok(ApiResponse { status, headers, body })
    }
}

struct ReqwestChunks {
    response: reqwest::Response,
    redactor: Redactor,
}

#[async_trait]
impl ChunkReader for ReqwestChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk.map(|b| b.to_vec())),
            Err(e) if e.is_timeout() => Err(TransportError::Timeout(self.redactor.sanitize(&e.to_string()))),
            Err(e) => Err(TransportError::Io(self.redactor.sanitize(&e.to_string()))),
        }
    }
}

#[async_trait]
impl DocumentSource for HttpTransport {
    async fn open(&self, url: &str, validators: &Validators) -> Result<SourceResponse, TransportError> {
        let mut builder = self.documents.get(url);
        if let Some(etag) = &validators.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = builder.send().await.map_err(|e| self.map_error(&e))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());

        Ok(SourceResponse {
            status,
            headers,
            body: Box::new(ReqwestChunks { response, redactor: self.redactor.clone() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_with_default_config() {
        let transport = HttpTransport::new(&SyncConfig::default(), &ApiToken::new("api.token"));
        assert!(transport.is_ok());
    }

    #[test]
    fn test_rejects_token_with_newline() {
        let transport = HttpTransport::new(&SyncConfig::default(), &ApiToken::new("api\ntoken"));
        let err = transport.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("invalid header"));
        assert!(!err.contains("api\ntoken"));
    }

    #[test]
    fn test_base_trailing_slash_trimmed() {
        let config = SyncConfig { api_base: "https://api.example.com/profiles/".into(), ..Default::default() };
        let transport = HttpTransport::new(&config, &ApiToken::new("t")).unwrap();
        assert_eq!(transport.base, "https://api.example.com/profiles");
    }
}
