// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Desired-state builder: remote document → [`FolderDefinition`].
//!
//! Accepted shapes:
//!
//! ```text
//! { "group": { "group": "<name>", "action": { "do": 0|1, "status": 0|1 } },
//!   "rules": [ { "PK": "<hostname>" }, ... ] }
//!
//! { "group": { ... },
//!   "rule_groups": [ { "action": { ... }, "rules": [ ... ] }, ... ] }
//! ```
//!
//! `rule_groups` wins when both are present. Missing actions default to
//! block/enabled. Rule entries without a non-empty string `PK` are ignored.

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::model::{FolderDefinition, RuleAction, RuleGroup};
use crate::sanitize::sanitize_for_log;
use crate::validation::is_valid_folder_name;

impl FolderDefinition {
    pub fn from_document(url: &str, document: &Value) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::Document {
            url: sanitize_for_log(url),
            reason: reason.to_string(),
        };

        let root = document.as_object().ok_or_else(|| invalid("root must be an object"))?;
        let group = root
            .get("group")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("missing 'group' object"))?;
        let name = group
            .get("group")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing folder name"))?;
        if !is_valid_folder_name(name) {
            return Err(ValidationError::FolderName(sanitize_for_log(name)));
        }

        let (action, enabled) = parse_action(group.get("action"))?;

        let groups = match (root.get("rule_groups"), root.get("rules")) {
            (Some(Value::Array(rule_groups)), _) if !rule_groups.is_empty() => rule_groups
                .iter()
                .map(|rg| {
                    let rg = rg.as_object().ok_or_else(|| invalid("rule group must be an object"))?;
                    let (action, enabled) = parse_action(rg.get("action"))?;
                    Ok::<_, ValidationError>(RuleGroup { action, enabled, hostnames: hostnames(rg) })
                })
                .collect::<Result<Vec<_>, ValidationError>>()?,
            (_, Some(Value::Array(_))) => vec![RuleGroup { action, enabled, hostnames: hostnames(root) }],
            _ => return Err(invalid("expected 'rules' list or non-empty 'rule_groups'")),
        };

        Ok(Self {
            name: name.trim().to_string(),
            action,
            enabled,
            groups,
            source_url: url.to_string(),
        })
    }
}

/// `{ "do": .., "status": .. }`; integers or numeric strings.
fn parse_action(action: Option<&Value>) -> Result<(RuleAction, bool), ValidationError> {
    let Some(action) = action.and_then(Value::as_object) else {
        return Ok((RuleAction::Block, true));
    };
    let kind = match wire_int(action.get("do")) {
        Some(v) => RuleAction::from_wire(v)?,
        None => RuleAction::Block,
    };
    let enabled = wire_int(action.get("status")).map_or(true, |s| s != 0);
    Ok((kind, enabled))
}

fn wire_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn hostnames(container: &Map<String, Value>) -> Vec<String> {
    container
        .get("rules")
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(|r| r.get("PK").and_then(Value::as_str))
                .filter(|pk| !pk.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
