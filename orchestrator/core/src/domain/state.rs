// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Control Loop State
//!
//! The loop state is an explicit, versioned value. Every function here takes
//! the prior state by value and returns the next one; nothing is mutated in
//! place and illegal phase edges are rejected with a [`TransitionError`].
//!
//! ```text
//! Initialize ─▶ Plan ─▶ Execute ─▶ Reflect ─▶ { Execute | Plan | Finalize }
//!                │  ▲      │  ▲
//!                ▼  │      ▼  │
//!           AwaitingApproval ─┘
//! ```
//!
//! `Plan → Plan` is a planning retry. Any non-terminal phase may move to
//! `Finalize`; `Finalize` has no outgoing edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::plan::{Plan, Step};
use crate::domain::reflection::Reflection;

/// What a pending approval covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ApprovalScope {
    /// One step under `Ask` autonomy.
    Step { step_number: u32 },
    /// The real pass of a whole plan under `Draft` autonomy.
    Plan { plan_version: u32 },
}

impl fmt::Display for ApprovalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalScope::Step { step_number } => write!(f, "step {step_number}"),
            ApprovalScope::Plan { plan_version } => write!(f, "plan v{plan_version}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub scope: ApprovalScope,
    pub approved_by: Option<String>,
    pub granted_at: DateTime<Utc>,
}

impl ApprovalGrant {
    pub fn new(scope: ApprovalScope, approved_by: Option<String>) -> Self {
        Self {
            scope,
            approved_by,
            granted_at: Utc::now(),
        }
    }

    /// Whether this grant allows `step` of plan `plan_version` to run for real.
    pub fn covers(&self, plan_version: u32, step: &Step) -> bool {
        match self.scope {
            ApprovalScope::Step { step_number } => step_number == step.step_number,
            ApprovalScope::Plan { plan_version: v } => v == plan_version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Initialize,
    Plan,
    AwaitingApproval { scope: ApprovalScope },
    Execute,
    Reflect,
    Finalize,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Plan => "plan",
            Phase::AwaitingApproval { .. } => "awaiting_approval",
            Phase::Execute => "execute",
            Phase::Reflect => "reflect",
            Phase::Finalize => "finalize",
        }
    }

    pub fn can_transition_to(&self, to: &Phase) -> bool {
        matches!(
            (self, to),
            (Phase::Initialize, Phase::Plan)
                | (Phase::Plan, Phase::Plan | Phase::Execute | Phase::AwaitingApproval { .. })
                | (Phase::AwaitingApproval { .. }, Phase::Execute)
                | (Phase::Execute, Phase::Reflect | Phase::Execute | Phase::AwaitingApproval { .. })
                | (Phase::Reflect, Phase::Execute | Phase::Plan)
        ) || (*self != Phase::Finalize && *to == Phase::Finalize)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::AwaitingApproval { scope } => write!(f, "awaiting_approval({scope})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Bumped on every state change.
    pub version: u64,
    pub phase: Phase,
    pub plan: Option<Plan>,
    /// Index of the next step of `plan` to execute.
    pub cursor: usize,
    pub replan_count: u32,
    pub grant: Option<ApprovalGrant>,
    pub last_reflection: Option<Reflection>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            version: 0,
            phase: Phase::Initialize,
            plan: None,
            cursor: 0,
            replan_count: 0,
            grant: None,
            last_reflection: None,
        }
    }

    pub fn transition(self, to: Phase) -> Result<Self, TransitionError> {
        if !self.phase.can_transition_to(&to) {
            return Err(TransitionError { from: self.phase, to });
        }
        Ok(Self {
            version: self.version + 1,
            phase: to,
            ..self
        })
    }

    /// Install a freshly validated plan. The cursor restarts and any grant
    /// issued for the previous plan is dropped.
    pub fn with_plan(self, plan: Plan) -> Self {
        Self {
            version: self.version + 1,
            plan: Some(plan),
            cursor: 0,
            grant: None,
            ..self
        }
    }

    /// Move past the current step. Step-scoped grants are single use.
    pub fn advance_cursor(self) -> Self {
        let grant = self
            .grant
            .filter(|g| matches!(g.scope, ApprovalScope::Plan { .. }));
        Self {
            version: self.version + 1,
            cursor: self.cursor + 1,
            grant,
            ..self
        }
    }

    pub fn record_replan(self) -> Self {
        Self {
            version: self.version + 1,
            replan_count: self.replan_count + 1,
            ..self
        }
    }

    pub fn with_grant(self, grant: ApprovalGrant) -> Self {
        Self {
            version: self.version + 1,
            grant: Some(grant),
            ..self
        }
    }

    pub fn with_reflection(self, reflection: Reflection) -> Self {
        Self {
            version: self.version + 1,
            last_reflection: Some(reflection),
            ..self
        }
    }

    pub fn plan_version(&self) -> u32 {
        self.plan.as_ref().map(|p| p.version).unwrap_or(0)
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.as_ref()?.step(self.cursor)
    }

    pub fn remaining_steps(&self) -> usize {
        self.plan
            .as_ref()
            .map(|p| p.len().saturating_sub(self.cursor))
            .unwrap_or(0)
    }

    /// The grant, if any, that lets `step` run for real.
    pub fn grant_for(&self, step: &Step) -> Option<&ApprovalGrant> {
        let version = self.plan_version();
        self.grant.as_ref().filter(|g| g.covers(version, step))
    }
}
