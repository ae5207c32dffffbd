// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Definition cache persistence between runs.
//!
//! Stores cached documents with their validators so the next run can send
//! conditional requests and reuse unchanged bodies.
//!
//! # Storage
//!
//! One JSON object keyed by URL:
//!
//! ```json
//! {
//!   "https://lists.example.com/ads.json": {
//!     "data": { "group": { "group": "Ads" }, "rules": [] },
//!     "etag": "\"abc\"",
//!     "last_modified": null,
//!     "fetched_at": 1767225600,
//!     "last_validated": 1767225600
//!   }
//! }
//! ```
//!
//! Writes go to a sibling temp file which is then renamed over the target.
//! On Unix a newly created directory is `0700` and the file `0600`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, DefinitionCache};
use crate::error::CacheError;
use crate::transport::Validators;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    data: Value,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    fetched_at: u64,
    #[serde(default)]
    last_validated: u64,
}

/// Result of reading the cache file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub dropped: usize,
}

pub struct CachePersistence {
    path: PathBuf,
}

impl CachePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file into `cache`. Malformed entries are dropped one by one;
    /// a missing file is an empty cache, not an error.
    pub fn load(&self, cache: &DefinitionCache) -> Result<LoadReport, CacheError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cache file, starting cold");
                return Ok(LoadReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        let root: Value = serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let Value::Object(map) = root else {
            return Err(CacheError::Corrupt("root is not an object".to_string()));
        };

        let mut report = LoadReport::default();
        for (url, value) in map {
            // A missing `data` key would otherwise deserialize as null
            let parsed = if value.get("data").is_some() {
                serde_json::from_value::<PersistedEntry>(value).map_err(|e| e.to_string())
            } else {
                Err("missing data".to_string())
            };
            match parsed {
                Ok(entry) => {
                    cache.restore(CacheEntry {
                        url,
                        validators: Validators { etag: entry.etag, last_modified: entry.last_modified },
                        document: Arc::new(entry.data),
                        fetched_at: entry.fetched_at,
                        last_validated: entry.last_validated,
                    });
                    report.loaded += 1;
                }
                Err(e) => {
                    debug!(url = %crate::sanitize::sanitize_for_log(&url), error = %e, "Dropping malformed cache entry");
                    report.dropped += 1;
                }
            }
        }

        info!(loaded = report.loaded, dropped = report.dropped, "Loaded definition cache");
        Ok(report)
    }

    /// [`load`](Self::load), degrading any failure to a cold cache.
    pub fn load_or_cold(&self, cache: &DefinitionCache) -> LoadReport {
        match self.load(cache) {
            Ok(report) => report,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Definition cache unreadable, starting cold");
                crate::metrics::record_cache("error");
                LoadReport::default()
            }
        }
    }

    /// Write every entry of `cache` atomically. Returns the entry count.
    pub fn save(&self, cache: &DefinitionCache) -> Result<usize, CacheError> {
        let entries: BTreeMap<String, PersistedEntry> = cache
            .entries()
            .into_iter()
            .map(|e| {
                (
                    e.url.clone(),
                    PersistedEntry {
                        data: Value::clone(&e.document),
                        etag: e.validators.etag.clone(),
                        last_modified: e.validators.last_modified.clone(),
                        fetched_at: e.fetched_at,
                        last_validated: e.last_validated,
                    },
                )
            })
            .collect();

        // Only a directory we create ourselves gets its mode tightened.
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
                restrict(dir, 0o700)?;
            }
        }

        let bytes = serde_json::to_vec(&entries).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        restrict(&tmp, 0o600)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), entries = entries.len(), "Saved definition cache");
        Ok(entries.len())
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = CachePersistence::new(dir.path().join("nested").join("blocklists.json"));

        let cache = DefinitionCache::new();
        cache.replace(
            "https://lists.example.com/a.json",
            Validators { etag: Some("\"v1\"".into()), last_modified: None },
            json!({"group": {"group": "A"}, "rules": []}),
        );
        assert_eq!(persistence.save(&cache).unwrap(), 1);

        let restored = DefinitionCache::new();
        let report = persistence.load(&restored).unwrap();
        assert_eq!(report, LoadReport { loaded: 1, dropped: 0 });

        let entry = restored.get("https://lists.example.com/a.json").unwrap();
        assert_eq!(entry.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(entry.document["group"]["group"], "A");
    }

    #[test]
    fn test_missing_file_is_cold() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = CachePersistence::new(dir.path().join("absent.json"));
        let cache = DefinitionCache::new();
        assert_eq!(persistence.load(&cache).unwrap(), LoadReport::default());
    }

    #[test]
    fn test_corrupt_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklists.json");
        fs::write(&path, b"{not json").unwrap();

        let persistence = CachePersistence::new(&path);
        let cache = DefinitionCache::new();
        assert!(matches!(persistence.load(&cache), Err(CacheError::Corrupt(_))));
        assert_eq!(persistence.load_or_cold(&cache), LoadReport::default());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_malformed_entries_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklists.json");
        let doc = json!({
            "https://good": {"data": {"rules": []}, "etag": "\"e\""},
            "https://no-data": {"etag": "\"e\""},
            "https://not-object": 7
        });
        fs::write(&path, doc.to_string()).unwrap();

        let cache = DefinitionCache::new();
        let report = CachePersistence::new(&path).load(&cache).unwrap();
        assert_eq!(report, LoadReport { loaded: 1, dropped: 2 });
        assert!(cache.get("https://good").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("blocklists.json");
        CachePersistence::new(&path).save(&DefinitionCache::new()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(!path.with_extension("tmp").exists());
    }
}
