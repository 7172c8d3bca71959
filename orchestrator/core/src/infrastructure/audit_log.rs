// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Audit recorders.
//!
//! - [`InMemoryAuditLog`] keeps the ordered trail per run and drops replays
//!   (a step number already stored, an approval decision already stored, a
//!   second finalization).
//! - [`FanoutAuditRecorder`] forwards every entry to several recorders, in
//!   order. A failing recorder does not stop the others.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::domain::audit::{ApprovalRecord, AuditEntry, AuditRecorder};
use crate::domain::repository::RepositoryError;
use crate::domain::run::{ExecutedStep, RunId, RunResult};
use crate::domain::state::Phase;

#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    trails: Arc<RwLock<HashMap<RunId, Vec<AuditEntry>>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full trail of a run in emission order.
    pub fn entries(&self, run_id: RunId) -> Vec<AuditEntry> {
        self.trails.read().get(&run_id).cloned().unwrap_or_default()
    }

    pub fn steps(&self, run_id: RunId) -> Vec<ExecutedStep> {
        self.entries(run_id)
            .into_iter()
            .filter_map(|e| match e {
                AuditEntry::Step { step, .. } => Some(step),
                _ => None,
            })
            .collect()
    }

    pub fn transitions(&self, run_id: RunId) -> Vec<(Phase, Phase)> {
        self.entries(run_id)
            .into_iter()
            .filter_map(|e| match e {
                AuditEntry::Transition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn approvals(&self, run_id: RunId) -> Vec<ApprovalRecord> {
        self.entries(run_id)
            .into_iter()
            .filter_map(|e| match e {
                AuditEntry::Approval { approval, .. } => Some(approval),
                _ => None,
            })
            .collect()
    }

    pub fn result(&self, run_id: RunId) -> Option<RunResult> {
        self.entries(run_id).into_iter().find_map(|e| match e {
            AuditEntry::Finalized { result, .. } => Some(*result),
            _ => None,
        })
    }

    /// Append unless `is_duplicate` matches an entry already in the trail.
    fn append_unless(&self, entry: AuditEntry, is_duplicate: impl Fn(&AuditEntry) -> bool) {
        let mut trails = self.trails.write();
        let trail = trails.entry(entry.run_id()).or_default();
        if trail.iter().any(is_duplicate) {
            return;
        }
        trail.push(entry);
    }
}

#[async_trait]
impl AuditRecorder for InMemoryAuditLog {
    async fn record_step(&self, run_id: RunId, step: &ExecutedStep) -> Result<(), RepositoryError> {
        let number = step.step_number;
        self.append_unless(
            AuditEntry::Step {
                run_id,
                step: step.clone(),
            },
            |e| matches!(e, AuditEntry::Step { step, .. } if step.step_number == number),
        );
        Ok(())
    }

    async fn record_transition(&self, run_id: RunId, from: Phase, to: Phase) -> Result<(), RepositoryError> {
        self.append_unless(
            AuditEntry::Transition {
                run_id,
                from,
                to,
                at: Utc::now(),
            },
            |_| false,
        );
        Ok(())
    }

    async fn record_approval(&self, run_id: RunId, approval: &ApprovalRecord) -> Result<(), RepositoryError> {
        let id = approval.request_id;
        let outcome = approval.outcome.clone();
        self.append_unless(
            AuditEntry::Approval {
                run_id,
                approval: approval.clone(),
            },
            |e| matches!(e, AuditEntry::Approval { approval, .. } if approval.request_id == id && approval.outcome == outcome),
        );
        Ok(())
    }

    async fn finalize(&self, run_id: RunId, result: &RunResult) -> Result<(), RepositoryError> {
        self.append_unless(
            AuditEntry::Finalized {
                run_id,
                result: Box::new(result.clone()),
            },
            |e| matches!(e, AuditEntry::Finalized { .. }),
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FanoutAuditRecorder {
    recorders: Vec<Arc<dyn AuditRecorder>>,
}

impl FanoutAuditRecorder {
    pub fn new(recorders: Vec<Arc<dyn AuditRecorder>>) -> Self {
        Self { recorders }
    }

    pub fn with(mut self, recorder: Arc<dyn AuditRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    fn report(results: Vec<Result<(), RepositoryError>>) -> Result<(), RepositoryError> {
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Audit recorder failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl AuditRecorder for FanoutAuditRecorder {
    async fn record_step(&self, run_id: RunId, step: &ExecutedStep) -> Result<(), RepositoryError> {
        let mut results = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            results.push(recorder.record_step(run_id, step).await);
        }
        Self::report(results)
    }

    async fn record_transition(&self, run_id: RunId, from: Phase, to: Phase) -> Result<(), RepositoryError> {
        let mut results = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            results.push(recorder.record_transition(run_id, from, to).await);
        }
        Self::report(results)
    }

    async fn record_approval(&self, run_id: RunId, approval: &ApprovalRecord) -> Result<(), RepositoryError> {
        let mut results = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            results.push(recorder.record_approval(run_id, approval).await);
        }
        Self::report(results)
    }

    async fn finalize(&self, run_id: RunId, result: &RunResult) -> Result<(), RepositoryError> {
        let mut results = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            results.push(recorder.finalize(run_id, result).await);
        }
        Self::report(results)
    }
}
