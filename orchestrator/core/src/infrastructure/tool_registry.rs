// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

// Tool Registry - Registration-time Validation and Lookup
//
// Holds the tool adapters the engine may invoke. Metadata is checked once,
// when a tool is registered:
// - id is non-empty, dotted lowercase (`notion.create_page`)
// - id is unique
// - capability tags are non-empty
// - critical-risk tools require approval

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::info;

use crate::domain::tool::{RiskLevel, Tool, ToolDescriptor};

static TOOL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").expect("tool id pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolRegistrationError {
    #[error("Invalid tool id '{0}': expected dotted lowercase segments")]
    InvalidId(String),

    #[error("Tool '{0}' is already registered")]
    Duplicate(String),

    #[error("Tool '{0}' declares an empty capability tag")]
    EmptyCapability(String),

    #[error("Tool '{0}' has critical risk but does not require approval")]
    CriticalWithoutApproval(String),
}

/// Registry of tool adapters, keyed by id
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolRegistrationError> {
        let id = tool.id().to_string();
        if !TOOL_ID.is_match(&id) {
            return Err(ToolRegistrationError::InvalidId(id));
        }
        if self.tools.contains_key(&id) {
            return Err(ToolRegistrationError::Duplicate(id));
        }
        let metadata = tool.metadata();
        if metadata.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ToolRegistrationError::EmptyCapability(id));
        }
        if metadata.risk_level == RiskLevel::Critical && !metadata.requires_approval {
            return Err(ToolRegistrationError::CriticalWithoutApproval(id));
        }

        info!(
            tool_id = %id,
            risk_level = ?metadata.risk_level,
            dry_run_supported = metadata.dry_run_supported,
            "Registered tool"
        );
        self.tools.insert(id, tool);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Result<Self, ToolRegistrationError> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools declaring `capability`, ordered by id
    pub fn filter_by_capability(&self, capability: &str) -> Vec<Arc<dyn Tool>> {
        self.tools
            .values()
            .filter(|t| t.metadata().has_capability(capability))
            .cloned()
            .collect()
    }

    /// Serializable view of every tool, handed to the planning oracle
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                id: t.id().to_string(),
                description: t.description().to_string(),
                metadata: t.metadata().clone(),
            })
            .collect()
    }
}
