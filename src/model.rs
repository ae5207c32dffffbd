// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Desired and observed entities.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Folder or rule-group action. Wire values: 0 = block, 1 = allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Block,
    Allow,
}

impl RuleAction {
    pub fn from_wire(value: i64) -> Result<Self, ValidationError> {
        match value {
            0 => Ok(Self::Block),
            1 => Ok(Self::Allow),
            other => Err(ValidationError::Action(other)),
        }
    }

    #[must_use]
    pub fn wire(self) -> u8 {
        match self {
            Self::Block => 0,
            Self::Allow => 1,
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Allow => write!(f, "allow"),
        }
    }
}

/// A run of hostnames sharing one action. Duplicates are kept until push time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    pub action: RuleAction,
    pub enabled: bool,
    pub hostnames: Vec<String>,
}

/// Validated folder built from one remote document. Immutable after build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderDefinition {
    pub name: String,
    pub action: RuleAction,
    pub enabled: bool,
    pub groups: Vec<RuleGroup>,
    pub source_url: String,
}

impl FolderDefinition {
    #[must_use]
    pub fn total_rules(&self) -> usize {
        self.groups.iter().map(|g| g.hostnames.len()).sum()
    }

    /// Rule count per action across all groups.
    #[must_use]
    pub fn action_breakdown(&self) -> (usize, usize) {
        self.groups.iter().fold((0, 0), |(block, allow), g| match g.action {
            RuleAction::Block => (block + g.hostnames.len(), allow),
            RuleAction::Allow => (block, allow + g.hostnames.len()),
        })
    }
}

/// Folder as it exists on the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
}
