// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Trail
//!
//! The core emits an append-only, ordered stream of audit entries per run.
//! Recorders must be idempotent: replaying an entry that was already stored
//! (same run, same step number) is a no-op. The control loop never emits a
//! step entry twice for one step number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::repository::RepositoryError;
use crate::domain::run::{ExecutedStep, RunId, RunResult};
use crate::domain::state::{ApprovalScope, Phase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Requested,
    Granted,
    Rejected { reason: String },
    TimedOut,
    Cancelled,
    /// The dry pass failed at `step_number`, so no request was opened. The
    /// record's preview ends with the failed step.
    PreviewFailed { step_number: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request_id: Uuid,
    pub scope: ApprovalScope,
    pub outcome: ApprovalOutcome,
    /// Who decided; `None` for requests, timeouts and cancellations.
    pub decided_by: Option<String>,
    /// Simulated steps shown to the approver of a draft plan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preview: Vec<ExecutedStep>,
    pub recorded_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn new(request_id: Uuid, scope: ApprovalScope, outcome: ApprovalOutcome) -> Self {
        Self {
            request_id,
            scope,
            outcome,
            decided_by: None,
            preview: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn decided_by(mut self, who: Option<String>) -> Self {
        self.decided_by = who;
        self
    }

    pub fn with_preview(mut self, preview: Vec<ExecutedStep>) -> Self {
        self.preview = preview;
        self
    }

    pub fn is_grant_for_step(&self, step_number: u32) -> bool {
        self.outcome == ApprovalOutcome::Granted
            && self.scope == ApprovalScope::Step { step_number }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum AuditEntry {
    Step {
        run_id: RunId,
        step: ExecutedStep,
    },
    Transition {
        run_id: RunId,
        from: Phase,
        to: Phase,
        at: DateTime<Utc>,
    },
    Approval {
        run_id: RunId,
        approval: ApprovalRecord,
    },
    Finalized {
        run_id: RunId,
        result: Box<RunResult>,
    },
}

impl AuditEntry {
    pub fn run_id(&self) -> RunId {
        match self {
            AuditEntry::Step { run_id, .. }
            | AuditEntry::Transition { run_id, .. }
            | AuditEntry::Approval { run_id, .. }
            | AuditEntry::Finalized { run_id, .. } => *run_id,
        }
    }
}

/// Sink for the audit trail. Implementations: the in-memory audit log, the
/// event bus and a fan-out over several recorders.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record_step(&self, run_id: RunId, step: &ExecutedStep) -> Result<(), RepositoryError>;

    async fn record_transition(&self, run_id: RunId, from: Phase, to: Phase) -> Result<(), RepositoryError>;

    async fn record_approval(&self, run_id: RunId, approval: &ApprovalRecord) -> Result<(), RepositoryError>;

    async fn finalize(&self, run_id: RunId, result: &RunResult) -> Result<(), RepositoryError>;
}
