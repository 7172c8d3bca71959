// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Run Aggregate
//!
//! A `Run` is one end-to-end execution attempt for a goal. It is created by
//! the admission guard, driven by the control loop (the only writer of
//! `status`) and frozen by finalization.
//!
//! ## Invariants
//! - `autonomy_level` is assigned at most once
//! - `executed_steps` is append-only and strictly ordered by `step_number`
//! - a terminal run is never mutated again
//! - a failed or cancelled run always carries a [`RunFailure`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::autonomy::AutonomyLevel;
use crate::domain::reflection::Reflection;
use crate::domain::tool::Artifact;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token deduplicating logically identical run requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

#[derive(Debug, Error)]
#[error("Idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters, got {0}")]
pub struct InvalidIdempotencyKey(pub usize);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidIdempotencyKey> {
        let key = key.into();
        let len = key.chars().count();
        if key.trim().is_empty() || len > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(InvalidIdempotencyKey(len));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id attached to every log line and event of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

impl TraceId {
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

/// Step-local failure. Recorded in the `ExecutedStep` and handed to the
/// reflector; never aborts the control loop by itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("Unresolved reference: {{{{{path}}}}}")]
    UnresolvedReference { path: String },

    #[error("Tool '{tool_id}' failed: {message}")]
    ToolExecution { tool_id: String, message: String },

    #[error("Tool '{tool_id}' is not registered")]
    UnknownTool { tool_id: String },

    #[error("Tool '{tool_id}' does not support dry-run execution")]
    DryRunUnsupported { tool_id: String },

    #[error("Tool '{tool_id}' returned an output not tagged as simulated during a dry run")]
    UntaggedDryRunOutput { tool_id: String },

    #[error("Tool '{tool_id}' was interrupted by the run deadline")]
    TimedOut { tool_id: String },
}

/// One attempted step. Never edited after it is appended to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub step_number: u32,
    pub tool_id: String,
    /// Input after template resolution, or the raw input when resolution failed.
    pub resolved_input: Value,
    pub output: Option<Value>,
    pub error: Option<StepError>,
    pub status: StepStatus,
    pub dry_run: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutedStep {
    pub fn succeeded(
        step_number: u32,
        tool_id: impl Into<String>,
        resolved_input: Value,
        output: Value,
        dry_run: bool,
        artifacts: Vec<Artifact>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_number,
            tool_id: tool_id.into(),
            resolved_input,
            output: Some(output),
            error: None,
            status: StepStatus::Success,
            dry_run,
            artifacts,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        step_number: u32,
        tool_id: impl Into<String>,
        resolved_input: Value,
        error: StepError,
        dry_run: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_number,
            tool_id: tool_id.into(),
            resolved_input,
            output: None,
            error: Some(error),
            status: StepStatus::Failed,
            dry_run,
            artifacts: Vec::new(),
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.error, Some(StepError::TimedOut { .. }))
    }
}

/// Run-level terminal reason. Its `Display` is what ends up in `Run.error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("Policy violation: {reason}")]
    PolicyViolation { reason: String },

    #[error("Planning failed: {reason}")]
    Planning { reason: String },

    #[error("Replan budget of {max_replans} exhausted")]
    ReplanBudgetExhausted { max_replans: u32 },

    #[error("Unrecoverable: {reason}")]
    Unrecoverable { reason: String },

    #[error("Run exceeded its {limit_secs}s timeout")]
    Timeout { limit_secs: u64 },

    #[error("Working memory expired before the run finished")]
    WorkingMemoryExpired,

    #[error("Step ceiling of {max_steps} reached")]
    StepLimitReached { max_steps: u32 },

    #[error("Approval rejected: {reason}")]
    ApprovalRejected { reason: String, rejected_by: Option<String> },

    #[error("Approval request timed out")]
    ApprovalTimedOut,

    #[error("Step {step_number} reached execution without an approval grant")]
    ApprovalMissing { step_number: u32 },

    #[error("Run cancelled{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled { reason: Option<String> },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("Autonomy level already fixed to {0}")]
    AutonomyAlreadyAssigned(AutonomyLevel),

    #[error("Step {got} recorded out of order (last recorded: {last})")]
    StepOutOfOrder { last: u32, got: u32 },

    #[error("Run is already finalized")]
    AlreadyFinalized,

    #[error("Run is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub actor: String,
    pub goal: String,
    pub status: RunStatus,
    pub idempotency_key: Option<IdempotencyKey>,
    pub trace_id: TraceId,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    autonomy_level: Option<AutonomyLevel>,
    error: Option<RunFailure>,
    executed_steps: Vec<ExecutedStep>,
    artifacts: Vec<Artifact>,
    replan_count: u32,
    /// Latest reflection, so a finalized run can rebuild its full result.
    #[serde(default)]
    final_reflection: Option<Reflection>,
}

impl Run {
    pub fn new(
        id: RunId,
        actor: impl Into<String>,
        goal: impl Into<String>,
        idempotency_key: Option<IdempotencyKey>,
        dry_run: bool,
    ) -> Self {
        Self {
            id,
            actor: actor.into(),
            goal: goal.into(),
            status: RunStatus::Pending,
            idempotency_key,
            trace_id: TraceId::new(),
            dry_run,
            created_at: Utc::now(),
            completed_at: None,
            autonomy_level: None,
            error: None,
            executed_steps: Vec::new(),
            artifacts: Vec::new(),
            replan_count: 0,
            final_reflection: None,
        }
    }

    pub fn autonomy_level(&self) -> Option<AutonomyLevel> {
        self.autonomy_level
    }

    pub fn error(&self) -> Option<&RunFailure> {
        self.error.as_ref()
    }

    pub fn executed_steps(&self) -> &[ExecutedStep] {
        &self.executed_steps
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn last_step_number(&self) -> u32 {
        self.executed_steps.last().map(|s| s.step_number).unwrap_or(0)
    }

    pub fn start(&mut self) -> Result<(), RunError> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        Ok(())
    }

    pub fn assign_autonomy(&mut self, level: AutonomyLevel) -> Result<(), RunError> {
        self.ensure_open()?;
        if let Some(existing) = self.autonomy_level {
            return Err(RunError::AutonomyAlreadyAssigned(existing));
        }
        self.autonomy_level = Some(level);
        Ok(())
    }

    /// Append an executed step. Artifacts are collected only from real
    /// (non-simulated) successful steps.
    pub fn record_step(&mut self, step: ExecutedStep) -> Result<(), RunError> {
        if self.status != RunStatus::Running {
            return Err(if self.status.is_terminal() {
                RunError::AlreadyFinalized
            } else {
                RunError::NotRunning
            });
        }
        let last = self.last_step_number();
        if step.step_number <= last {
            return Err(RunError::StepOutOfOrder {
                last,
                got: step.step_number,
            });
        }
        if step.is_success() && !step.dry_run {
            self.artifacts.extend(step.artifacts.iter().cloned());
        }
        self.executed_steps.push(step);
        Ok(())
    }

    pub fn record_reflection(&mut self, reflection: Reflection) -> Result<(), RunError> {
        self.ensure_open()?;
        self.final_reflection = Some(reflection);
        Ok(())
    }

    pub fn record_replan(&mut self) -> Result<(), RunError> {
        self.ensure_open()?;
        self.replan_count += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), RunError> {
        self.ensure_open()?;
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, failure: RunFailure) -> Result<(), RunError> {
        self.ensure_open()?;
        self.status = match failure {
            RunFailure::Cancelled { .. } => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), RunError> {
        if self.status.is_terminal() {
            Err(RunError::AlreadyFinalized)
        } else {
            Ok(())
        }
    }
}

/// Immutable outcome produced by finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub trace_id: TraceId,
    pub autonomy_level: Option<AutonomyLevel>,
    pub executed_steps: Vec<ExecutedStep>,
    pub artifacts: Vec<Artifact>,
    pub replan_count: u32,
    pub error: Option<String>,
    pub failure: Option<RunFailure>,
    pub final_reflection: Option<Reflection>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            trace_id: run.trace_id.clone(),
            autonomy_level: run.autonomy_level,
            executed_steps: run.executed_steps.clone(),
            artifacts: run.artifacts.clone(),
            replan_count: run.replan_count,
            error: run.error.as_ref().map(ToString::to_string),
            failure: run.error.clone(),
            final_reflection: run.final_reflection.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.created_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_run() -> Run {
        let mut run = Run::new(RunId::new(), "user_1", "summarize issues", None, false);
        run.start().unwrap();
        run
    }

    fn ok_step(n: u32) -> ExecutedStep {
        ExecutedStep::succeeded(n, "local.echo", json!({}), json!({"n": n}), false, vec![], Utc::now())
    }

    #[test]
    fn test_autonomy_is_assigned_once() {
        let mut run = running_run();
        run.assign_autonomy(AutonomyLevel::Draft).unwrap();
        let err = run.assign_autonomy(AutonomyLevel::ExecuteSilent).unwrap_err();
        assert_eq!(err, RunError::AutonomyAlreadyAssigned(AutonomyLevel::Draft));
        assert_eq!(run.autonomy_level(), Some(AutonomyLevel::Draft));
    }

    #[test]
    fn test_steps_are_append_only_and_ordered() {
        let mut run = running_run();
        run.record_step(ok_step(1)).unwrap();
        run.record_step(ok_step(2)).unwrap();
        assert_eq!(
            run.record_step(ok_step(2)).unwrap_err(),
            RunError::StepOutOfOrder { last: 2, got: 2 }
        );
        assert_eq!(run.executed_steps().len(), 2);
    }

    #[test]
    fn test_simulated_artifacts_are_not_collected() {
        let mut run = running_run();
        let artifact = Artifact::new("notion_page", "https://notion.so/p/1", "Digest");
        let mut simulated = ok_step(1);
        simulated.dry_run = true;
        simulated.artifacts = vec![artifact.clone()];
        run.record_step(simulated).unwrap();
        assert!(run.artifacts().is_empty());

        let mut real = ok_step(2);
        real.artifacts = vec![artifact.clone()];
        run.record_step(real).unwrap();
        assert_eq!(run.artifacts(), &[artifact]);
    }

    #[test]
    fn test_terminal_run_is_frozen() {
        let mut run = running_run();
        run.fail(RunFailure::WorkingMemoryExpired).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.record_step(ok_step(1)).unwrap_err(), RunError::AlreadyFinalized);
        assert_eq!(run.complete().unwrap_err(), RunError::AlreadyFinalized);
    }

    #[test]
    fn test_cancellation_maps_to_cancelled_status() {
        let mut run = running_run();
        run.fail(RunFailure::Cancelled { reason: Some("operator".into()) }).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error().unwrap().to_string(), "Run cancelled: operator");
    }

    #[test]
    fn test_idempotency_key_bounds() {
        assert!(IdempotencyKey::new("n8n_exec_550e8400").is_ok());
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_unresolved_reference_message() {
        let err = StepError::UnresolvedReference { path: "step1.result".into() };
        assert_eq!(err.to_string(), "Unresolved reference: {{step1.result}}");
    }
}
