// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Control Loop
//!
//! Drives one run from `Initialize` to `Finalize`:
//!
//! ```text
//! Plan ──▶ Execute ──▶ Reflect ──▶ Execute | Plan | Finalize
//!             │   ▲
//!             ▼   │
//!       AwaitingApproval
//! ```
//!
//! - `ExecuteNotify` / `ExecuteSilent`: reflect after every step.
//! - `Ask`: each step waits for its own approval; the batch ends when the plan
//!   is exhausted or a step fails, then one reflection.
//! - `Draft`: the remaining plan first runs as a dry pass against a scratch
//!   copy of memory, the preview is attached to one plan-level approval, and
//!   the approved real pass runs as one batch.
//!
//! Autonomy is fixed by the first accepted plan. A later plan that brings in
//! a `requires_approval` tool under `ExecuteNotify`/`ExecuteSilent` waits for
//! one plan-level approval before it runs, unless the level came from an
//! honored override.
//!
//! The loop is the only writer of `Run.status`. Every phase change goes to the
//! audit recorder; cancellation is observed between steps and while waiting
//! for an approval, the run deadline everywhere a future can be dropped.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::application::autonomy_resolver::{AutonomyResolver, AutonomySource};
use crate::application::executor::{StepExecutor, StepInvocation, StepOutcome};
use crate::application::reflector::Reflector;
use crate::application::request::ValidatedRequest;
use crate::domain::audit::{ApprovalOutcome, ApprovalRecord, AuditRecorder};
use crate::domain::autonomy::AutonomyLevel;
use crate::domain::config::EngineConfig;
use crate::domain::events::RunEvent;
use crate::domain::memory::{step_entry, step_key, MemoryError, WorkingMemory, WorkingMemoryStore};
use crate::domain::plan::{Plan, Step};
use crate::domain::planner::{Planner, PlanningError, PlanningRequest, ReflectionOracle, ReflectionRequest};
use crate::domain::reflection::NextAction;
use crate::domain::repository::RunRepository;
use crate::domain::run::{ExecutedStep, Run, RunFailure, RunId, RunResult};
use crate::domain::state::{ApprovalGrant, ApprovalScope, Phase, RunState};
use crate::infrastructure::approval_service::{ApprovalService, ApprovalStatus};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::telemetry;
use crate::infrastructure::tool_registry::ToolRegistry;

/// Cancellation request for one run, with an optional operator reason.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first reason wins; later calls only re-trigger the token.
    pub fn cancel(&self, reason: Option<String>) {
        {
            let mut slot = self.reason.lock();
            if !self.token.is_cancelled() {
                *slot = reason;
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Mutable per-run bookkeeping owned by one `drive` call.
struct Progress {
    run: Run,
    state: RunState,
    context: Value,
    max_steps: u32,
    timeout: Duration,
    autonomy_override: Option<AutonomyLevel>,
    approval_waived: bool,
    deadline: Instant,
    /// The step that ended the current batch, possibly a simulated preview step.
    latest: Option<ExecutedStep>,
}

impl Progress {
    fn timeout_failure(&self) -> RunFailure {
        RunFailure::Timeout {
            limit_secs: self.timeout.as_secs(),
        }
    }

    fn take_state(&mut self) -> RunState {
        std::mem::take(&mut self.state)
    }
}

enum Preview {
    Ready(Vec<ExecutedStep>),
    Failed {
        simulated: Vec<ExecutedStep>,
        failed: ExecutedStep,
    },
}

enum ApprovalWait {
    Decided(ApprovalStatus),
    Cancelled,
    DeadlinePassed,
}

fn internal(reason: impl ToString) -> RunFailure {
    RunFailure::Internal {
        reason: reason.to_string(),
    }
}

fn memory_failure(error: MemoryError) -> RunFailure {
    match error {
        MemoryError::Expired(_) | MemoryError::NotFound(_) => RunFailure::WorkingMemoryExpired,
        MemoryError::KeyExists(key) => internal(format!("working memory key '{key}' written twice")),
    }
}

fn accept_plan(generated: Plan, version: u32, next_step_number: u32) -> Result<Plan, PlanningError> {
    let plan = Plan::new(version, generated.steps);
    plan.validate(next_step_number)?;
    Ok(plan)
}

pub struct ControlLoop {
    config: Arc<EngineConfig>,
    planner: Arc<dyn Planner>,
    resolver: AutonomyResolver,
    executor: StepExecutor,
    reflector: Reflector,
    approvals: Arc<ApprovalService>,
    memory: Arc<dyn WorkingMemoryStore>,
    runs: Arc<dyn RunRepository>,
    audit: Arc<dyn AuditRecorder>,
    events: EventBus,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        planner: Arc<dyn Planner>,
        oracle: Arc<dyn ReflectionOracle>,
        tools: Arc<ToolRegistry>,
        approvals: Arc<ApprovalService>,
        memory: Arc<dyn WorkingMemoryStore>,
        runs: Arc<dyn RunRepository>,
        audit: Arc<dyn AuditRecorder>,
        events: EventBus,
    ) -> Self {
        let max_replans = config.spec.execution.max_replans;
        Self {
            resolver: AutonomyResolver::new(config.clone()),
            executor: StepExecutor::new(tools),
            reflector: Reflector::new(oracle, max_replans),
            config,
            planner,
            approvals,
            memory,
            runs,
            audit,
            events,
        }
    }

    /// Run to completion. Never fails: every outcome, including internal
    /// errors, ends as a finalized run.
    pub async fn drive(&self, run: Run, request: &ValidatedRequest, cancel: &CancelSignal) -> RunResult {
        let span = tracing::info_span!("run", run_id = %run.id, trace_id = %run.trace_id, actor = %run.actor);
        let mut progress = Progress {
            run,
            state: RunState::new(),
            context: request.context.clone(),
            max_steps: request.max_steps,
            timeout: request.timeout,
            autonomy_override: request.autonomy_override,
            approval_waived: false,
            deadline: Instant::now() + request.timeout,
            latest: None,
        };
        async move {
            let outcome = self.run_phases(&mut progress, cancel).await;
            self.finalize(progress, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self, p: &mut Progress, cancel: &CancelSignal) -> Result<(), RunFailure> {
        p.run.start().map_err(internal)?;
        self.save(&p.run).await;
        info!(goal = %p.run.goal, dry_run = p.run.dry_run, "Run started");
        self.advance(p, Phase::Plan).await?;

        loop {
            self.checkpoint(p, cancel)?;
            match p.state.phase {
                Phase::Plan => self.plan(p, cancel).await?,
                Phase::Execute => self.execute(p, cancel).await?,
                Phase::Reflect => {
                    if self.reflect(p).await? {
                        return Ok(());
                    }
                }
                other => return Err(internal(format!("control loop resumed in phase {other}"))),
            }
        }
    }

    fn checkpoint(&self, p: &Progress, cancel: &CancelSignal) -> Result<(), RunFailure> {
        if cancel.is_cancelled() {
            return Err(RunFailure::Cancelled {
                reason: cancel.reason(),
            });
        }
        if Instant::now() >= p.deadline {
            return Err(p.timeout_failure());
        }
        Ok(())
    }

    async fn plan(&self, p: &mut Progress, cancel: &CancelSignal) -> Result<(), RunFailure> {
        let plan_version = p.state.plan_version() + 1;
        let next_step_number = p.run.last_step_number() + 1;
        let request = PlanningRequest {
            run_id: p.run.id,
            goal: p.run.goal.clone(),
            context: p.context.clone(),
            executed_steps: p.run.executed_steps().to_vec(),
            reflection: p.state.last_reflection.clone(),
            plan_version,
            next_step_number,
            tools: self.executor.tools().descriptors(),
        };

        let generated = tokio::time::timeout_at(p.deadline, self.planner.generate(&request))
            .await
            .map_err(|_| p.timeout_failure())?;

        let plan = match generated.and_then(|plan| accept_plan(plan, plan_version, next_step_number)) {
            Ok(plan) => plan,
            Err(e) => {
                let max_replans = self.config.spec.execution.max_replans;
                if p.state.replan_count < max_replans {
                    warn!(error = %e, replan_count = p.state.replan_count, "Planning failed, retrying");
                    self.count_replan(p)?;
                    return self.advance(p, Phase::Plan).await;
                }
                warn!(error = %e, "Planning failed with no replans left");
                return Err(RunFailure::Planning { reason: e.to_string() });
            }
        };

        self.check_policy(&p.run.actor, &plan)?;

        if p.run.autonomy_level().is_none() {
            let decision = self
                .resolver
                .resolve(&p.run.actor, &plan, self.executor.tools(), p.autonomy_override);
            p.run.assign_autonomy(decision.level).map_err(internal)?;
            p.approval_waived = decision.source == AutonomySource::Override;
            info!(
                level = %decision.level,
                source = ?decision.source,
                capped_by_approval = decision.capped_by_approval,
                "Autonomy resolved"
            );
            self.events.publish(RunEvent::AutonomyResolved {
                run_id: p.run.id,
                level: decision.level,
                resolved_at: Utc::now(),
            });
        }

        info!(plan_version, step_count = plan.len(), "Plan accepted");
        self.events.publish(RunEvent::PlanAccepted {
            run_id: p.run.id,
            plan_version,
            step_count: plan.len(),
            accepted_at: Utc::now(),
        });
        let gated = self.needs_plan_approval(p, &plan);
        p.state = p.take_state().with_plan(plan);
        p.latest = None;
        self.save(&p.run).await;

        if gated {
            info!(plan_version, "Plan uses a tool that requires approval");
            return self
                .await_approval(p, ApprovalScope::Plan { plan_version }, Vec::new(), cancel)
                .await;
        }
        self.advance(p, Phase::Execute).await
    }

    /// The first plan is covered by the resolver's cap; later plans keep the
    /// fixed level and get a plan-level approval instead.
    fn needs_plan_approval(&self, p: &Progress, plan: &Plan) -> bool {
        let Some(level) = p.run.autonomy_level() else {
            return false;
        };
        !p.approval_waived && !level.is_batch_gated() && AutonomyResolver::requires_approval(plan, self.executor.tools())
    }

    /// Every step's tool must be registered and covered by the actor's scopes.
    fn check_policy(&self, actor: &str, plan: &Plan) -> Result<(), RunFailure> {
        let policy = self.config.policy_for(actor).ok_or_else(|| RunFailure::PolicyViolation {
            reason: format!("no policy matches actor '{actor}'"),
        })?;
        for step in &plan.steps {
            if !self.executor.tools().contains(&step.tool_id) {
                return Err(RunFailure::PolicyViolation {
                    reason: format!("step {} uses unregistered tool '{}'", step.step_number, step.tool_id),
                });
            }
            if !policy.allows_tool(&step.tool_id) {
                return Err(RunFailure::PolicyViolation {
                    reason: format!("actor '{actor}' may not use tool '{}'", step.tool_id),
                });
            }
        }
        Ok(())
    }

    async fn execute(&self, p: &mut Progress, cancel: &CancelSignal) -> Result<(), RunFailure> {
        let Some(step) = p.state.current_step().cloned() else {
            return self.advance(p, Phase::Reflect).await;
        };
        let autonomy = p
            .run
            .autonomy_level()
            .ok_or_else(|| internal("autonomy level was never resolved"))?;

        if p.run.executed_steps().len() as u32 >= p.max_steps {
            return Err(RunFailure::StepLimitReached { max_steps: p.max_steps });
        }

        let memory = self.load_memory(p.run.id).await?;
        let plan_version = p.state.plan_version();
        let granted = p.state.grant_for(&step).is_some();

        match autonomy {
            AutonomyLevel::Draft if !granted => {
                return match self.preview(p, &memory).await? {
                    Preview::Ready(preview) => {
                        self.await_approval(p, ApprovalScope::Plan { plan_version }, preview, cancel)
                            .await
                    }
                    Preview::Failed { mut simulated, failed } => {
                        warn!(step_number = failed.step_number, "Draft preview failed");
                        simulated.push(failed.clone());
                        let record = ApprovalRecord::new(
                            Uuid::new_v4(),
                            ApprovalScope::Plan { plan_version },
                            ApprovalOutcome::PreviewFailed {
                                step_number: failed.step_number,
                            },
                        )
                        .with_preview(simulated);
                        self.record_approval(p.run.id, record).await;
                        p.latest = Some(failed);
                        self.advance(p, Phase::Reflect).await
                    }
                };
            }
            AutonomyLevel::Ask if !granted => {
                let scope = ApprovalScope::Step {
                    step_number: step.step_number,
                };
                return self.await_approval(p, scope, Vec::new(), cancel).await;
            }
            _ => {}
        }

        let invocation = StepInvocation {
            run_id: p.run.id,
            actor: &p.run.actor,
            step: &step,
            autonomy,
            plan_version,
            dry_run: p.run.dry_run,
            grant: p.state.grant_for(&step),
            approval_waived: p.approval_waived,
            deadline: p.deadline,
        };
        let executed = match self.executor.execute(invocation, &memory).await {
            StepOutcome::Executed(executed) => executed,
            StepOutcome::Halted(failure) => return Err(failure),
        };

        info!(
            step_number = executed.step_number,
            tool_id = %executed.tool_id,
            status = ?executed.status,
            "Step executed"
        );
        p.run.record_step(executed.clone()).map_err(internal)?;
        if let Err(e) = self.audit.record_step(p.run.id, &executed).await {
            warn!(step_number = executed.step_number, error = %e, "Failed to record step");
        }
        self.save(&p.run).await;

        if autonomy.notifies() {
            self.events.publish(RunEvent::StepNotification {
                run_id: p.run.id,
                step_number: executed.step_number,
                tool_id: executed.tool_id.clone(),
                status: executed.status,
                notified_at: Utc::now(),
            });
        }

        p.state = p.take_state().advance_cursor();
        let succeeded = executed.is_success();
        if succeeded {
            let output = executed.output.clone().unwrap_or(Value::Null);
            self.memory
                .append(p.run.id, &step_key(executed.step_number), step_entry(output))
                .await
                .map_err(memory_failure)?;
        }
        p.latest = Some(executed);

        let next = if autonomy.is_batch_gated() && succeeded && p.state.remaining_steps() > 0 {
            Phase::Execute
        } else {
            Phase::Reflect
        };
        self.advance(p, next).await
    }

    /// Dry pass over the remaining plan against a scratch copy of memory.
    async fn preview(&self, p: &Progress, memory: &WorkingMemory) -> Result<Preview, RunFailure> {
        let Some(plan) = p.state.plan.as_ref() else {
            return Ok(Preview::Ready(Vec::new()));
        };
        let mut scratch = memory.clone();
        let mut preview = Vec::with_capacity(p.state.remaining_steps());

        for step in plan.steps.iter().skip(p.state.cursor) {
            let invocation = StepInvocation {
                run_id: p.run.id,
                actor: &p.run.actor,
                step,
                autonomy: AutonomyLevel::Draft,
                plan_version: plan.version,
                dry_run: true,
                grant: None,
                approval_waived: p.approval_waived,
                deadline: p.deadline,
            };
            match self.executor.execute(invocation, &scratch).await {
                StepOutcome::Executed(simulated) if simulated.is_success() => {
                    let output = simulated.output.clone().unwrap_or(Value::Null);
                    scratch
                        .record_step_output(simulated.step_number, output)
                        .map_err(memory_failure)?;
                    preview.push(simulated);
                }
                StepOutcome::Executed(failed) => {
                    return Ok(Preview::Failed {
                        simulated: preview,
                        failed,
                    })
                }
                StepOutcome::Halted(failure) => return Err(failure),
            }
        }
        debug!(steps = preview.len(), "Draft preview ready");
        Ok(Preview::Ready(preview))
    }

    async fn await_approval(
        &self,
        p: &mut Progress,
        scope: ApprovalScope,
        preview: Vec<ExecutedStep>,
        cancel: &CancelSignal,
    ) -> Result<(), RunFailure> {
        self.advance(p, Phase::AwaitingApproval { scope }).await?;
        let run_id = p.run.id;

        let prompt = match (scope, p.state.current_step()) {
            (ApprovalScope::Step { step_number }, Some(step)) => {
                format!("Run step {step_number} with tool '{}' for goal: {}", step.tool_id, p.run.goal)
            }
            (ApprovalScope::Plan { plan_version }, _) if preview.is_empty() => format!(
                "Run plan v{plan_version} ({} steps, includes tools that require approval) for goal: {}",
                p.state.remaining_steps(),
                p.run.goal
            ),
            (ApprovalScope::Plan { plan_version }, _) => format!(
                "Run plan v{plan_version} ({} steps, preview attached) for goal: {}",
                p.state.remaining_steps(),
                p.run.goal
            ),
            (ApprovalScope::Step { step_number }, None) => format!("Run step {step_number}"),
        };
        let pending = self
            .approvals
            .open(
                run_id,
                scope,
                prompt,
                preview.clone(),
                self.config.spec.execution.approval_timeout,
            )
            .await
            .map_err(internal)?;
        let request_id = pending.id;
        self.record_approval(
            run_id,
            ApprovalRecord::new(request_id, scope, ApprovalOutcome::Requested).with_preview(preview),
        )
        .await;

        let waited = tokio::select! {
            status = pending.wait() => ApprovalWait::Decided(status),
            _ = cancel.cancelled() => ApprovalWait::Cancelled,
            _ = tokio::time::sleep_until(p.deadline) => ApprovalWait::DeadlinePassed,
        };

        match waited {
            ApprovalWait::Decided(ApprovalStatus::Approved { approved_by, .. }) => {
                self.record_approval(
                    run_id,
                    ApprovalRecord::new(request_id, scope, ApprovalOutcome::Granted).decided_by(approved_by.clone()),
                )
                .await;
                p.state = p.take_state().with_grant(ApprovalGrant::new(scope, approved_by));
                self.advance(p, Phase::Execute).await
            }
            ApprovalWait::Decided(ApprovalStatus::Rejected {
                reason, rejected_by, ..
            }) => {
                self.record_approval(
                    run_id,
                    ApprovalRecord::new(request_id, scope, ApprovalOutcome::Rejected { reason: reason.clone() })
                        .decided_by(rejected_by.clone()),
                )
                .await;
                Err(RunFailure::ApprovalRejected { reason, rejected_by })
            }
            ApprovalWait::Decided(ApprovalStatus::TimedOut { .. }) => {
                self.record_approval(run_id, ApprovalRecord::new(request_id, scope, ApprovalOutcome::TimedOut))
                    .await;
                Err(RunFailure::ApprovalTimedOut)
            }
            ApprovalWait::Decided(ApprovalStatus::Cancelled) | ApprovalWait::Cancelled => {
                self.approvals.cancel_for_run(run_id).await;
                self.record_approval(run_id, ApprovalRecord::new(request_id, scope, ApprovalOutcome::Cancelled))
                    .await;
                Err(RunFailure::Cancelled {
                    reason: cancel.reason(),
                })
            }
            ApprovalWait::DeadlinePassed => {
                self.approvals.cancel_for_run(run_id).await;
                self.record_approval(run_id, ApprovalRecord::new(request_id, scope, ApprovalOutcome::TimedOut))
                    .await;
                Err(p.timeout_failure())
            }
        }
    }

    /// Returns `true` when the run is done.
    async fn reflect(&self, p: &mut Progress) -> Result<bool, RunFailure> {
        let memory = self.load_memory(p.run.id).await?;
        let remaining_steps: Vec<Step> = p
            .state
            .plan
            .as_ref()
            .map(|plan| plan.steps.iter().skip(p.state.cursor).cloned().collect())
            .unwrap_or_default();
        let request = ReflectionRequest {
            run_id: p.run.id,
            goal: p.run.goal.clone(),
            executed_steps: p.run.executed_steps().to_vec(),
            latest: p.latest.clone(),
            remaining_steps,
            memory,
        };

        let judgement = tokio::time::timeout_at(p.deadline, self.reflector.reflect(&request, p.state.replan_count))
            .await
            .map_err(|_| p.timeout_failure())?;
        let reflection = judgement.reflection;

        self.memory
            .set_reflection(p.run.id, reflection.clone())
            .await
            .map_err(memory_failure)?;
        p.run.record_reflection(reflection.clone()).map_err(internal)?;
        p.state = p.take_state().with_reflection(reflection.clone());

        match reflection.next_action {
            NextAction::Done => Ok(true),
            NextAction::Failed => Err(judgement.failure.unwrap_or(RunFailure::Unrecoverable {
                reason: reflection.reasoning,
            })),
            NextAction::Continue => {
                self.advance(p, Phase::Execute).await?;
                Ok(false)
            }
            NextAction::Replan => {
                self.count_replan(p)?;
                self.advance(p, Phase::Plan).await?;
                Ok(false)
            }
        }
    }

    async fn finalize(&self, mut p: Progress, outcome: Result<(), RunFailure>) -> RunResult {
        if p.state.phase != Phase::Finalize {
            if let Err(e) = self.advance(&mut p, Phase::Finalize).await {
                error!(error = %e, "Could not enter finalize phase");
            }
        }

        let closed = match outcome {
            Ok(()) => p.run.complete(),
            Err(failure) => {
                warn!(failure = %failure, "Run failed");
                p.run.fail(failure)
            }
        };
        if let Err(e) = closed {
            error!(error = %e, "Run was already finalized");
        }
        self.save(&p.run).await;

        let result = RunResult::from_run(&p.run);
        if let Err(e) = self.audit.finalize(p.run.id, &result).await {
            warn!(error = %e, "Failed to record run result");
        }
        telemetry::record_finalized(result.status);
        if let Err(e) = self.memory.remove(p.run.id).await {
            debug!(error = %e, "Working memory already gone at finalization");
        }

        info!(
            status = ?result.status,
            steps = result.executed_steps.len(),
            replan_count = result.replan_count,
            duration_ms = result.duration_ms(),
            "Run finalized"
        );
        result
    }

    async fn advance(&self, p: &mut Progress, to: Phase) -> Result<(), RunFailure> {
        let from = p.state.phase;
        p.state = p.take_state().transition(to).map_err(internal)?;
        debug!(from = %from, to = %to, version = p.state.version, "Phase transition");
        if let Err(e) = self.audit.record_transition(p.run.id, from, to).await {
            warn!(from = %from, to = %to, error = %e, "Failed to record transition");
        }
        Ok(())
    }

    fn count_replan(&self, p: &mut Progress) -> Result<(), RunFailure> {
        p.run.record_replan().map_err(internal)?;
        p.state = p.take_state().record_replan();
        Ok(())
    }

    async fn load_memory(&self, run_id: RunId) -> Result<WorkingMemory, RunFailure> {
        self.memory.load(run_id).await.map_err(memory_failure)
    }

    async fn record_approval(&self, run_id: RunId, record: ApprovalRecord) {
        if let Err(e) = self.audit.record_approval(run_id, &record).await {
            warn!(request_id = %record.request_id, error = %e, "Failed to record approval");
        }
    }

    async fn save(&self, run: &Run) {
        if let Err(e) = self.runs.save(run).await {
            warn!(run_id = %run.id, error = %e, "Failed to persist run");
        }
    }
}
