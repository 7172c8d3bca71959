// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Autonomy Resolver
//!
//! Computes the approval policy of a run, once, from the first accepted plan.
//! Precedence, highest first:
//!
//! | # | Source | Effect |
//! |---|--------|--------|
//! | 1 | explicit override | used as-is, only if the actor may override |
//! | 2 | a tool with `requires_approval` | caps the result of 3/4 at `Draft` |
//! | 3 | actor default | the policy's `default_autonomy` |
//! | 4 | risk heuristic | see [`AutonomyResolver::heuristic`] |

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::autonomy::AutonomyLevel;
use crate::domain::config::EngineConfig;
use crate::domain::plan::Plan;
use crate::domain::tool::{RiskLevel, ToolMetadata};
use crate::infrastructure::tool_registry::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomySource {
    Override,
    ActorDefault,
    RiskHeuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutonomyDecision {
    pub level: AutonomyLevel,
    pub source: AutonomySource,
    /// The level was lowered because a tool requires approval.
    pub capped_by_approval: bool,
}

pub struct AutonomyResolver {
    config: Arc<EngineConfig>,
}

impl AutonomyResolver {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn resolve(
        &self,
        actor: &str,
        plan: &Plan,
        tools: &ToolRegistry,
        override_level: Option<AutonomyLevel>,
    ) -> AutonomyDecision {
        let policy = self.config.policy_for(actor);

        if let Some(level) = override_level {
            if policy.is_some_and(|p| p.can_override_autonomy) {
                debug!(actor = %actor, level = %level, "Autonomy override honored");
                return AutonomyDecision {
                    level,
                    source: AutonomySource::Override,
                    capped_by_approval: false,
                };
            }
            warn!(actor = %actor, level = %level, "Actor may not override autonomy, ignoring override");
        }

        let (candidate, source) = match policy.and_then(|p| p.default_autonomy) {
            Some(level) => (level, AutonomySource::ActorDefault),
            None => (self.heuristic(plan, tools), AutonomySource::RiskHeuristic),
        };

        let level = if Self::requires_approval(plan, tools) {
            candidate.most_conservative(AutonomyLevel::Draft)
        } else {
            candidate
        };

        AutonomyDecision {
            level,
            source,
            capped_by_approval: level != candidate,
        }
    }

    /// Whether any registered tool in `plan` is flagged `requires_approval`.
    pub fn requires_approval(plan: &Plan, tools: &ToolRegistry) -> bool {
        plan.tool_ids()
            .filter_map(|id| tools.get(id))
            .any(|t| t.metadata().requires_approval)
    }

    /// Risk-based fallback:
    /// - empty plan or unknown tool metadata: `Ask`
    /// - any critical risk: `Ask`
    /// - any high risk or destructive tool: `Draft`
    /// - any external communication, medium risk, non-idempotent tool, or
    ///   more steps than the configured threshold: `ExecuteNotify`
    /// - otherwise `ExecuteSilent`
    pub fn heuristic(&self, plan: &Plan, tools: &ToolRegistry) -> AutonomyLevel {
        if plan.is_empty() {
            return AutonomyLevel::Ask;
        }
        let mut metadata: Vec<ToolMetadata> = Vec::with_capacity(plan.len());
        for id in plan.tool_ids() {
            match tools.get(id) {
                Some(tool) => metadata.push(tool.metadata().clone()),
                None => return AutonomyLevel::Ask,
            }
        }

        if metadata.iter().any(|m| m.risk_level == RiskLevel::Critical) {
            return AutonomyLevel::Ask;
        }
        if metadata
            .iter()
            .any(|m| m.risk_level == RiskLevel::High || m.is_destructive())
        {
            return AutonomyLevel::Draft;
        }
        let threshold = self.config.spec.risk.step_count_threshold;
        if plan.len() > threshold
            || metadata.iter().any(|m| {
                m.communicates_externally() || m.risk_level == RiskLevel::Medium || !m.idempotent
            })
        {
            return AutonomyLevel::ExecuteNotify;
        }
        AutonomyLevel::ExecuteSilent
    }
}
