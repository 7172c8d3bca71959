// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Oracles
//!
//! Plan generation and progress judgement are delegated to external oracles
//! (typically LLM-backed). Only their contracts live here. Both are
//! untrusted: plans are validated by the control loop and judgements are
//! filtered through the reflector policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::memory::WorkingMemory;
use crate::domain::plan::{Plan, PlanValidationError, Step};
use crate::domain::reflection::Reflection;
use crate::domain::run::{ExecutedStep, RunId};
use crate::domain::tool::ToolDescriptor;

/// Everything the planning oracle gets for an initial plan or a replan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningRequest {
    pub run_id: RunId,
    pub goal: String,
    pub context: Value,
    /// Full executed history, empty for the initial plan.
    pub executed_steps: Vec<ExecutedStep>,
    /// The reflection that triggered a replan.
    pub reflection: Option<Reflection>,
    pub plan_version: u32,
    /// The returned plan must be numbered from here, contiguously.
    pub next_step_number: u32,
    pub tools: Vec<ToolDescriptor>,
}

impl PlanningRequest {
    pub fn is_replan(&self) -> bool {
        self.plan_version > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("Planning oracle failed: {0}")]
    Oracle(String),

    #[error("Invalid plan: {0}")]
    Invalid(#[from] PlanValidationError),
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Return a complete ordered step list for the request.
    async fn generate(&self, request: &PlanningRequest) -> Result<Plan, PlanningError>;
}

/// Input to a progress judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub run_id: RunId,
    pub goal: String,
    pub executed_steps: Vec<ExecutedStep>,
    /// The step that ended the batch. Under `Draft` this may be a simulated
    /// step that is not part of `executed_steps`.
    pub latest: Option<ExecutedStep>,
    pub remaining_steps: Vec<Step>,
    pub memory: WorkingMemory,
}

impl ReflectionRequest {
    pub fn latest_failed(&self) -> bool {
        self.latest.as_ref().is_some_and(|s| !s.is_success())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Reflection oracle failed: {0}")]
pub struct OracleError(pub String);

#[async_trait]
pub trait ReflectionOracle: Send + Sync {
    async fn evaluate(&self, request: &ReflectionRequest) -> Result<Reflection, OracleError>;
}
