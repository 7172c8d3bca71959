// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Run Service
//!
//! Caller-facing entry point of the engine.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** admit runs, spawn their control loops, route
//!   approvals and cancellations, answer status queries
//! - **Collaborators:**
//!   - Domain: Run aggregate, RunRepository, WorkingMemoryStore, AuditRecorder
//!   - Infrastructure: ApprovalService, EventBus, in-memory stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::control_loop::{CancelSignal, ControlLoop};
use crate::application::error::EngineError;
use crate::application::guard::{Admission, AdmissionGuard};
use crate::application::request::RunRequest;
use crate::domain::audit::AuditRecorder;
use crate::domain::autonomy::AutonomyLevel;
use crate::domain::config::EngineConfig;
use crate::domain::events::RunEvent;
use crate::domain::memory::{WorkingMemory, WorkingMemoryStore};
use crate::domain::planner::{Planner, ReflectionOracle};
use crate::domain::repository::{IdempotencyStore, RunRepository};
use crate::domain::run::{ExecutedStep, IdempotencyKey, Run, RunId, RunResult, RunStatus};
use crate::infrastructure::approval_service::{ApprovalService, PendingApprovalInfo};
use crate::infrastructure::audit_log::{FanoutAuditRecorder, InMemoryAuditLog};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::idempotency_store::InMemoryIdempotencyStore;
use crate::infrastructure::memory_store::InMemoryWorkingMemoryStore;
use crate::infrastructure::repositories::InMemoryRunRepository;
use crate::infrastructure::telemetry;
use crate::infrastructure::tool_registry::ToolRegistry;

/// Snapshot returned by [`RunService::get_run_status`].
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub actor: String,
    pub status: RunStatus,
    pub autonomy_level: Option<AutonomyLevel>,
    pub trace_id: String,
    pub steps_executed: usize,
    pub replan_count: u32,
    pub error: Option<String>,
    pub pending_approval: Option<PendingApprovalInfo>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RunService: Send + Sync {
    /// Validate, admit and start a run. Returns as soon as the run is spawned.
    ///
    /// # Errors
    ///
    /// - Validation: malformed request
    /// - PolicyViolation: no policy matches the actor
    /// - DuplicateRequest: the idempotency key already names a run
    /// - RateLimited: the actor's quota for the window is spent
    async fn create_run(&self, request: RunRequest) -> Result<RunId, EngineError>;

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusView, EngineError>;

    async fn list_executed_steps(&self, run_id: RunId) -> Result<Vec<ExecutedStep>, EngineError>;

    /// Approve the run's pending step or plan approval.
    async fn approve(
        &self,
        run_id: RunId,
        approved_by: Option<String>,
        feedback: Option<String>,
    ) -> Result<(), EngineError>;

    async fn reject(&self, run_id: RunId, reason: String, rejected_by: Option<String>) -> Result<(), EngineError>;

    async fn list_pending_approvals(&self) -> Vec<PendingApprovalInfo>;

    /// Request cancellation. Honored between steps and while awaiting approval.
    async fn cancel_run(&self, run_id: RunId, reason: Option<String>) -> Result<(), EngineError>;

    async fn wait_for_completion(&self, run_id: RunId, timeout: Duration) -> Result<RunResult, EngineError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, EngineError>;
}

/// Storage and messaging collaborators shared by every run.
#[derive(Clone)]
pub struct EngineComponents {
    pub runs: Arc<dyn RunRepository>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub memory: Arc<dyn WorkingMemoryStore>,
    pub audit: Arc<dyn AuditRecorder>,
    pub approvals: Arc<ApprovalService>,
    pub events: EventBus,
}

impl EngineComponents {
    /// Process-local stores. The audit trail goes to the returned log and to
    /// the event bus.
    pub fn in_memory() -> (Self, InMemoryAuditLog) {
        let events = EventBus::with_default_capacity();
        let log = InMemoryAuditLog::new();
        let recorders: Vec<Arc<dyn AuditRecorder>> = vec![Arc::new(log.clone()), Arc::new(events.clone())];
        let audit = FanoutAuditRecorder::new(recorders);
        let components = Self {
            runs: Arc::new(InMemoryRunRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            memory: Arc::new(InMemoryWorkingMemoryStore::new()),
            audit: Arc::new(audit),
            approvals: Arc::new(ApprovalService::new()),
            events,
        };
        (components, log)
    }
}

struct RunHandle {
    cancel: CancelSignal,
    done: watch::Receiver<Option<RunResult>>,
}

pub struct StandardRunService {
    config: Arc<EngineConfig>,
    guard: AdmissionGuard,
    control_loop: Arc<ControlLoop>,
    runs: Arc<dyn RunRepository>,
    memory: Arc<dyn WorkingMemoryStore>,
    approvals: Arc<ApprovalService>,
    events: EventBus,
    handles: Arc<DashMap<RunId, RunHandle>>,
}

impl StandardRunService {
    pub fn new(
        config: Arc<EngineConfig>,
        planner: Arc<dyn Planner>,
        oracle: Arc<dyn ReflectionOracle>,
        tools: Arc<ToolRegistry>,
        components: EngineComponents,
    ) -> Self {
        let control_loop = ControlLoop::new(
            config.clone(),
            planner,
            oracle,
            tools,
            components.approvals.clone(),
            components.memory.clone(),
            components.runs.clone(),
            components.audit,
            components.events.clone(),
        );
        Self {
            guard: AdmissionGuard::new(config.clone(), components.idempotency),
            config,
            control_loop: Arc::new(control_loop),
            runs: components.runs,
            memory: components.memory,
            approvals: components.approvals,
            events: components.events,
            handles: Arc::new(DashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs whose control loop has not finished yet.
    pub fn live_runs(&self) -> usize {
        self.handles.len()
    }

    pub async fn list_runs_for_actor(&self, actor: &str) -> Result<Vec<Run>, EngineError> {
        Ok(self.runs.find_by_actor(actor).await?)
    }

    pub async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>, EngineError> {
        Ok(self.runs.find_by_status(status).await?)
    }

    fn reject_admission(&self, actor: &str, error: EngineError) -> EngineError {
        warn!(actor = %actor, error = %error, "Run request rejected");
        self.events.publish(RunEvent::AdmissionRejected {
            actor: actor.to_string(),
            reason: error.to_string(),
            rejected_at: Utc::now(),
        });
        error
    }

    async fn require_run(&self, run_id: RunId) -> Result<Run, EngineError> {
        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or(EngineError::NotFound(run_id))
    }
}

#[async_trait]
impl RunService for StandardRunService {
    async fn create_run(&self, request: RunRequest) -> Result<RunId, EngineError> {
        let actor = request.actor.clone();
        let validated = match request.validate(&self.config) {
            Ok(validated) => validated,
            Err(e) => {
                telemetry::record_rejected("validation");
                return Err(self.reject_admission(&actor, e));
            }
        };

        if self.config.policy_for(&validated.actor).is_none() {
            telemetry::record_rejected("policy_violation");
            let error = EngineError::PolicyViolation(format!("no policy matches actor '{}'", validated.actor));
            return Err(self.reject_admission(&validated.actor, error));
        }

        let key = validated.idempotency_key.clone();
        let run_id = match self.guard.admit(key.as_ref(), &validated.actor).await? {
            Admission::Admitted(run_id) => run_id,
            Admission::Duplicate(existing_run_id) => {
                return Err(self.reject_admission(&validated.actor, EngineError::DuplicateRequest { existing_run_id }));
            }
            Admission::RateLimited { retry_after } => {
                return Err(self.reject_admission(&validated.actor, EngineError::RateLimited { retry_after }));
            }
        };

        let run = Run::new(
            run_id,
            validated.actor.clone(),
            validated.goal.clone(),
            key.clone(),
            validated.dry_run,
        );
        if let Err(e) = self.runs.save(&run).await {
            self.guard.release(key.as_ref(), run_id).await?;
            return Err(e.into());
        }
        let memory = WorkingMemory::new(run_id, validated.context.clone());
        if let Err(e) = self.memory.create(memory, self.config.spec.memory.ttl).await {
            self.guard.release(key.as_ref(), run_id).await?;
            return Err(EngineError::Internal(format!("failed to create working memory: {e}")));
        }

        info!(run_id = %run_id, actor = %run.actor, trace_id = %run.trace_id, "Run admitted");
        self.events.publish(RunEvent::RunAdmitted {
            run_id,
            actor: run.actor.clone(),
            trace_id: run.trace_id.to_string(),
            admitted_at: Utc::now(),
        });

        let (done_tx, done_rx) = watch::channel(None);
        let cancel = CancelSignal::new();
        self.handles.insert(
            run_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        // The handle lives until the loop finishes; later waiters read the
        // finalized run from the repository.
        let control_loop = self.control_loop.clone();
        let handles = self.handles.clone();
        tokio::spawn(async move {
            let result = control_loop.drive(run, &validated, &cancel).await;
            let _ = done_tx.send(Some(result));
            handles.remove(&run_id);
        });

        Ok(run_id)
    }

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusView, EngineError> {
        let run = self.require_run(run_id).await?;
        let pending_approval = self.approvals.pending_for_run(run_id).await;
        Ok(RunStatusView {
            run_id,
            actor: run.actor.clone(),
            status: run.status,
            autonomy_level: run.autonomy_level(),
            trace_id: run.trace_id.to_string(),
            steps_executed: run.executed_steps().len(),
            replan_count: run.replan_count(),
            error: run.error().map(ToString::to_string),
            pending_approval,
            created_at: run.created_at,
            completed_at: run.completed_at,
        })
    }

    async fn list_executed_steps(&self, run_id: RunId) -> Result<Vec<ExecutedStep>, EngineError> {
        Ok(self.require_run(run_id).await?.executed_steps().to_vec())
    }

    async fn approve(
        &self,
        run_id: RunId,
        approved_by: Option<String>,
        feedback: Option<String>,
    ) -> Result<(), EngineError> {
        self.require_run(run_id).await?;
        self.approvals
            .approve(run_id, feedback, approved_by)
            .await
            .map_err(|e| EngineError::Approval(e.to_string()))?;
        Ok(())
    }

    async fn reject(&self, run_id: RunId, reason: String, rejected_by: Option<String>) -> Result<(), EngineError> {
        self.require_run(run_id).await?;
        self.approvals
            .reject(run_id, reason, rejected_by)
            .await
            .map_err(|e| EngineError::Approval(e.to_string()))?;
        Ok(())
    }

    async fn list_pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        self.approvals.list_pending().await
    }

    async fn cancel_run(&self, run_id: RunId, reason: Option<String>) -> Result<(), EngineError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "run {run_id} is already finalized ({:?})",
                run.status
            )));
        }
        let handle = self
            .handles
            .get(&run_id)
            .map(|h| h.cancel.clone())
            .ok_or_else(|| EngineError::Internal(format!("run {run_id} has no live control loop")))?;
        info!(run_id = %run_id, reason = ?reason, "Run cancellation requested");
        handle.cancel(reason);
        Ok(())
    }

    async fn wait_for_completion(&self, run_id: RunId, timeout: Duration) -> Result<RunResult, EngineError> {
        let Some(mut done) = self.handles.get(&run_id).map(|h| h.done.clone()) else {
            let run = self.require_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(RunResult::from_run(&run));
            }
            return Err(EngineError::Internal(format!("run {run_id} has no live control loop")));
        };

        let waited = tokio::time::timeout(timeout, async move {
            done.wait_for(Option::is_some).await.map(|result| result.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(result))) => Ok(result),
            Ok(Ok(None)) | Ok(Err(_)) => Err(EngineError::Internal(format!(
                "control loop of run {run_id} ended without a result"
            ))),
            Err(_) => Err(EngineError::WaitTimedOut {
                run_id,
                waited: timeout,
            }),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, EngineError> {
        let key = IdempotencyKey::new(key).map_err(|e| EngineError::Validation(e.to_string()))?;
        Ok(self.runs.find_by_idempotency_key(&key).await?)
    }
}
