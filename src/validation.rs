// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identifier and content predicates.
//!
//! Everything that ends up in a request path (profile id, folder id) or in a
//! remote record (rule, folder name) is checked against a strict whitelist.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;

pub const MAX_PROFILE_ID_LEN: usize = 64;

static DASHBOARD_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"controld\.com/dashboard/profiles/([^/?#\s]+)").unwrap());

/// Unicode bidi controls that can visually reorder a folder name.
const BIDI_CONTROLS: [char; 11] = [
    '\u{202a}', '\u{202b}', '\u{202c}', '\u{202d}', '\u{202e}',
    '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
    '\u{200e}', '\u{200f}',
];

const FORBIDDEN_NAME_CHARS: [char; 7] = ['<', '>', '"', '\'', '`', '/', '\\'];

/// Extract a profile id from a dashboard URL, or return the trimmed input.
#[must_use]
pub fn normalize_profile_id(input: &str) -> String {
    let trimmed = input.trim();
    DASHBOARD_URL
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or_else(|| trimmed.to_string(), |m| m.as_str().to_string())
}

#[must_use]
pub fn is_valid_profile_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PROFILE_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn validate_profile_id(id: &str) -> Result<(), ValidationError> {
    if is_valid_profile_id(id) {
        Ok(())
    } else {
        Err(ValidationError::ProfileId(crate::sanitize::sanitize_for_log(id)))
    }
}

/// Remote folder key. Ends up as a path segment, so `.` and `..` are refused.
#[must_use]
pub fn is_valid_folder_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[must_use]
pub fn is_valid_rule(rule: &str) -> bool {
    !rule.is_empty()
        && rule
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '*' | '/' | '@'))
}

#[must_use]
pub fn is_valid_folder_name(name: &str) -> bool {
    let clean = name.trim();
    if clean.is_empty() || clean == "." || clean == ".." || clean.starts_with('-') {
        return false;
    }
    name.chars().all(|c| {
        !c.is_control() && !FORBIDDEN_NAME_CHARS.contains(&c) && !BIDI_CONTROLS.contains(&c)
    })
}

pub fn validate_folder_name(name: &str) -> Result<(), ValidationError> {
    if is_valid_folder_name(name) {
        Ok(())
    } else {
        Err(ValidationError::FolderName(crate::sanitize::sanitize_for_log(name)))
    }
}
