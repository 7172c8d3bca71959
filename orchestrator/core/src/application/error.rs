// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Caller-facing error taxonomy.
//!
//! Every variant here is raised before a run executes anything (admission,
//! validation, policy) or by an operation on an existing run. Step-local
//! failures live in `StepError`; run-level terminal reasons in `RunFailure`.

use std::time::Duration;
use thiserror::Error;

use crate::domain::repository::RepositoryError;
use crate::domain::run::RunId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Duplicate request: run {existing_run_id} already owns this idempotency key")]
    DuplicateRequest { existing_run_id: RunId },

    #[error("Rate limited: retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error("Approval error: {0}")]
    Approval(String),

    #[error("Run {run_id} did not finish within {}ms", .waited.as_millis())]
    WaitTimedOut { run_id: RunId, waited: Duration },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable tag, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::DuplicateRequest { .. } => "duplicate",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::NotFound(_) => "not_found",
            EngineError::Approval(_) => "approval",
            EngineError::WaitTimedOut { .. } => "wait_timed_out",
            EngineError::Repository(_) => "repository",
            EngineError::Internal(_) => "internal",
        }
    }
}
