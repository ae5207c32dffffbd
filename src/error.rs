// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! Every error surfaced by the crate maps onto an [`ErrorKind`] so reports can
//! group failures without matching on concrete enums. Messages never carry the
//! bearer credential: transport errors are sanitized when they are built.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification used in reports and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed identifier, URL or document. Fatal to one item only.
    Validation,
    /// Timeout, connect failure, 5xx. Retried until attempts run out.
    TransientNetwork,
    /// 4xx other than 429. Never retried.
    FatalApi,
    /// 429 responses that outlasted the retry budget.
    RateLimitExceeded,
    /// Some items of a multi-item operation failed.
    PartialFailure,
    /// Unreadable or corrupt cache. Degrades to a cold fetch.
    Cache,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientNetwork => "transient_network",
            Self::FatalApi => "fatal_api",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::PartialFailure => "partial_failure",
            Self::Cache => "cache",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid profile id '{0}'")]
    ProfileId(String),
    #[error("invalid folder id '{0}'")]
    FolderId(String),
    #[error("invalid rule '{0}'")]
    Rule(String),
    #[error("invalid folder name '{0}'")]
    FolderName(String),
    #[error("unsafe url {url}: {reason}")]
    Url { url: String, reason: String },
    #[error("invalid document from {url}: {reason}")]
    Document { url: String, reason: String },
    #[error("unsupported action value {0}")]
    Action(i64),
    #[error("folder '{0}' is defined by more than one source")]
    DuplicateFolder(String),
    #[error("no usable folder urls")]
    NoSources,
}

/// Failure below HTTP: the request never produced a status line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("i/o error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{operation}: transport failure after {attempts} attempt(s): {source}")]
    Transport {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("{operation}: server error {status} after {attempts} attempt(s)")]
    Server {
        operation: String,
        status: u16,
        attempts: u32,
    },
    #[error("{operation}: rate limited after {attempts} attempt(s)")]
    RateLimited {
        operation: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },
    #[error("{operation}: rejected with status {status}: {detail}")]
    Fatal {
        operation: String,
        status: u16,
        detail: String,
    },
    #[error("{operation}: malformed response: {detail}")]
    Decode { operation: String, detail: String },
}

impl ApiError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Server { .. } | Self::RateLimited { .. }
        )
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Fatal { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Transport { .. } | Self::Decode { .. } => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::Server { .. } => ErrorKind::TransientNetwork,
            Self::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            Self::Fatal { .. } | Self::Decode { .. } => ErrorKind::FatalApi,
        }
    }

    /// Server-requested wait carried by a 429, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn with_attempts(self, n: u32) -> Self {
        match self {
            Self::Transport { operation, source, .. } => Self::Transport { operation, attempts: n, source },
            Self::Server { operation, status, .. } => Self::Server { operation, status, attempts: n },
            Self::RateLimited { operation, retry_after, .. } => {
                Self::RateLimited { operation, attempts: n, retry_after }
            }
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("fetching {url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("response from {url} has unsupported content type '{content_type}'")]
    ContentType { url: String, content_type: String },
    #[error("response from {url} is not valid json: {detail}")]
    Json { url: String, detail: String },
}

impl FetchError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::TransientNetwork,
            Self::Status { status, .. } if *status >= 500 || *status == 429 => ErrorKind::TransientNetwork,
            Self::Status { .. } => ErrorKind::FatalApi,
            Self::Validation(_) | Self::TooLarge { .. } | Self::ContentType { .. } | Self::Json { .. } => {
                ErrorKind::Validation
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file is corrupt: {0}")]
    Corrupt(String),
}

impl CacheError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let server = ApiError::Server { operation: "GET rules".into(), status: 502, attempts: 1 };
        let limited = ApiError::RateLimited { operation: "POST rules".into(), attempts: 1, retry_after: None };
        let fatal = ApiError::Fatal { operation: "GET groups".into(), status: 403, detail: String::new() };
        let transport = ApiError::Transport {
            operation: "DELETE groups".into(),
            attempts: 1,
            source: TransportError::Timeout("30s".into()),
        };

        assert!(server.is_retryable());
        assert!(limited.is_retryable());
        assert!(transport.is_retryable());
        assert!(!fatal.is_retryable());

        assert_eq!(fatal.kind(), ErrorKind::FatalApi);
        assert_eq!(limited.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(server.status(), Some(502));
        assert_eq!(transport.status(), None);
    }

    #[test]
    fn test_with_attempts_rewrites_count() {
        let err = ApiError::Server { operation: "GET rules".into(), status: 500, attempts: 1 }.with_attempts(10);
        assert_eq!(err.to_string(), "GET rules: server error 500 after 10 attempt(s)");
    }

    #[test]
    fn test_fetch_error_kinds() {
        let too_large = FetchError::TooLarge { url: "https://x".into(), limit: 10 };
        assert_eq!(too_large.kind(), ErrorKind::Validation);
        let gone = FetchError::Status { url: "https://x".into(), status: 404 };
        assert_eq!(gone.kind(), ErrorKind::FatalApi);
        let flaky = FetchError::Status { url: "https://x".into(), status: 503 };
        assert_eq!(flaky.kind(), ErrorKind::TransientNetwork);
    }
}
