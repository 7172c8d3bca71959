// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Contract
//!
//! Tools are the only place side effects happen. Concrete adapters (Notion,
//! GitHub, Slack, ...) live outside this crate and plug in through the [`Tool`]
//! trait; the engine only relies on the declared [`ToolMetadata`] and on the
//! dry-run contract:
//!
//! - with `ctx.dry_run == true` a tool must not perform any externally
//!   observable effect and must return a [`ToolOutput`] tagged `simulated`;
//! - tools that cannot simulate declare `dry_run_supported: false` and are
//!   never invoked in dry-run mode.
//!
//! Metadata is validated structurally when the tool is registered
//! (see `infrastructure::tool_registry`), not at call time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::run::RunId;

/// Capability tag marking tools that delete or irreversibly mutate data.
pub const CAPABILITY_DESTRUCTIVE: &str = "destructive";
/// Capability tag marking tools that send messages to people or systems
/// outside the engine (email, chat, webhooks).
pub const CAPABILITY_EXTERNAL_COMMUNICATION: &str = "external_communication";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Declared tool properties consumed by the autonomy resolver and executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub dry_run_supported: bool,
    #[serde(default)]
    pub idempotent: bool,
    /// The tool stops cleanly when its future is dropped, so the run deadline
    /// may interrupt it.
    #[serde(default)]
    pub cancellable: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

impl ToolMetadata {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_destructive(&self) -> bool {
        self.has_capability(CAPABILITY_DESTRUCTIVE)
    }

    pub fn communicates_externally(&self) -> bool {
        self.has_capability(CAPABILITY_EXTERNAL_COMMUNICATION)
    }
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    pub actor: String,
    pub run_id: RunId,
    pub step_number: u32,
    pub dry_run: bool,
}

/// A durable output produced as a side effect of a step (a created page, an
/// opened issue, an uploaded file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Artifact {
    pub fn new(artifact_type: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            url: url.into(),
            title: title.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub data: Value,
    /// Set by the tool when the output was produced in dry-run mode.
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl ToolOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            simulated: false,
            artifacts: Vec::new(),
        }
    }

    pub fn simulated(data: Value) -> Self {
        Self {
            data,
            simulated: true,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Error reported by a tool. Always absorbed into a failed `ExecutedStep`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ToolError {
    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Upstream service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Dotted identifier, e.g. `notion.create_page`.
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn metadata(&self) -> &ToolMetadata;

    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput, ToolError>;
}

/// Serializable view of a registered tool, handed to planning oracles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub description: String,
    pub metadata: ToolMetadata,
}
