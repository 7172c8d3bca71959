// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::audit::ApprovalRecord;
use crate::domain::autonomy::AutonomyLevel;
use crate::domain::run::{ExecutedStep, RunId, RunResult, RunStatus, StepStatus};
use crate::domain::state::Phase;

/// Everything observers can see about runs, published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunAdmitted {
        run_id: RunId,
        actor: String,
        trace_id: String,
        admitted_at: DateTime<Utc>,
    },
    /// Pre-execution rejection. No run exists, hence no run id.
    AdmissionRejected {
        actor: String,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    PhaseChanged {
        run_id: RunId,
        from: Phase,
        to: Phase,
        changed_at: DateTime<Utc>,
    },
    AutonomyResolved {
        run_id: RunId,
        level: AutonomyLevel,
        resolved_at: DateTime<Utc>,
    },
    PlanAccepted {
        run_id: RunId,
        plan_version: u32,
        step_count: usize,
        accepted_at: DateTime<Utc>,
    },
    StepRecorded {
        run_id: RunId,
        step: ExecutedStep,
    },
    ApprovalRecorded {
        run_id: RunId,
        approval: ApprovalRecord,
    },
    /// Emitted per executed step when the run's autonomy asks for notifications.
    StepNotification {
        run_id: RunId,
        step_number: u32,
        tool_id: String,
        status: StepStatus,
        notified_at: DateTime<Utc>,
    },
    RunFinalized {
        run_id: RunId,
        status: RunStatus,
        result: Box<RunResult>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunEvent::AdmissionRejected { .. } => None,
            RunEvent::RunAdmitted { run_id, .. }
            | RunEvent::PhaseChanged { run_id, .. }
            | RunEvent::AutonomyResolved { run_id, .. }
            | RunEvent::PlanAccepted { run_id, .. }
            | RunEvent::StepRecorded { run_id, .. }
            | RunEvent::ApprovalRecorded { run_id, .. }
            | RunEvent::StepNotification { run_id, .. }
            | RunEvent::RunFinalized { run_id, .. } => Some(*run_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunFinalized { .. })
    }
}
