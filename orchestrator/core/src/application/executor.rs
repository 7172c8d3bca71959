// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Step Executor
//!
//! Runs exactly one plan step: approval gate, template resolution, tool
//! lookup, invocation under the run deadline, dry-run contract checks.
//!
//! Tool and resolution failures never escape as errors. They become a failed
//! [`ExecutedStep`] that the reflector decides about. The only thing that
//! halts the run from here is a step reaching real execution without an
//! approval grant, either under `Ask`/`Draft` or on a tool that requires
//! approval, which is a control-loop bug.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::domain::autonomy::AutonomyLevel;
use crate::domain::memory::WorkingMemory;
use crate::domain::plan::Step;
use crate::domain::run::{ExecutedStep, RunFailure, RunId, StepError};
use crate::domain::state::ApprovalGrant;
use crate::domain::tool::ToolContext;
use crate::infrastructure::telemetry;
use crate::infrastructure::tool_registry::ToolRegistry;

/// One step invocation as seen by the executor.
#[derive(Debug, Clone)]
pub struct StepInvocation<'a> {
    pub run_id: RunId,
    pub actor: &'a str,
    pub step: &'a Step,
    pub autonomy: AutonomyLevel,
    pub plan_version: u32,
    pub dry_run: bool,
    pub grant: Option<&'a ApprovalGrant>,
    /// An honored autonomy override lifts per-tool `requires_approval`.
    pub approval_waived: bool,
    pub deadline: Instant,
}

impl StepInvocation<'_> {
    fn is_granted(&self) -> bool {
        self.grant.is_some_and(|g| g.covers(self.plan_version, self.step))
    }

    fn halt_ungranted(&self) -> StepOutcome {
        error!(
            run_id = %self.run_id,
            step_number = self.step.step_number,
            tool_id = %self.step.tool_id,
            autonomy = %self.autonomy,
            "Step reached execution without an approval grant"
        );
        StepOutcome::Halted(RunFailure::ApprovalMissing {
            step_number: self.step.step_number,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Executed(ExecutedStep),
    Halted(RunFailure),
}

pub struct StepExecutor {
    tools: Arc<ToolRegistry>,
}

impl StepExecutor {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn execute(&self, invocation: StepInvocation<'_>, memory: &WorkingMemory) -> StepOutcome {
        let step = invocation.step;
        let started_at = Utc::now();

        if invocation.autonomy.is_batch_gated() && !invocation.dry_run && !invocation.is_granted() {
            return invocation.halt_ungranted();
        }

        let resolved = match memory.resolve(&step.input) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(run_id = %invocation.run_id, step_number = step.step_number, error = %e, "Template resolution failed");
                return self.finish(ExecutedStep::failed(
                    step.step_number,
                    &step.tool_id,
                    step.input.clone(),
                    e,
                    invocation.dry_run,
                    started_at,
                ));
            }
        };

        let failed = |error: StepError, input| {
            ExecutedStep::failed(step.step_number, &step.tool_id, input, error, invocation.dry_run, started_at)
        };

        let Some(tool) = self.tools.get(&step.tool_id) else {
            return self.finish(failed(
                StepError::UnknownTool { tool_id: step.tool_id.clone() },
                resolved,
            ));
        };
        let metadata = tool.metadata();

        if metadata.requires_approval && !invocation.dry_run && !invocation.approval_waived && !invocation.is_granted() {
            return invocation.halt_ungranted();
        }

        if invocation.dry_run && !metadata.dry_run_supported {
            return self.finish(failed(
                StepError::DryRunUnsupported { tool_id: step.tool_id.clone() },
                resolved,
            ));
        }

        let ctx = ToolContext {
            actor: invocation.actor.to_string(),
            run_id: invocation.run_id,
            step_number: step.step_number,
            dry_run: invocation.dry_run,
        };

        debug!(
            run_id = %invocation.run_id,
            step_number = step.step_number,
            tool_id = %step.tool_id,
            dry_run = invocation.dry_run,
            "Invoking tool"
        );

        // Only tools that stop cleanly on drop are raced against the deadline.
        let result = if metadata.cancellable {
            match tokio::time::timeout_at(invocation.deadline, tool.execute(&ctx, resolved.clone())).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(run_id = %invocation.run_id, step_number = step.step_number, "Tool interrupted by run deadline");
                    return self.finish(failed(
                        StepError::TimedOut { tool_id: step.tool_id.clone() },
                        resolved,
                    ));
                }
            }
        } else {
            tool.execute(&ctx, resolved.clone()).await
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                return self.finish(failed(
                    StepError::ToolExecution {
                        tool_id: step.tool_id.clone(),
                        message: e.to_string(),
                    },
                    resolved,
                ));
            }
        };

        if invocation.dry_run && !output.simulated {
            return self.finish(failed(
                StepError::UntaggedDryRunOutput { tool_id: step.tool_id.clone() },
                resolved,
            ));
        }

        self.finish(ExecutedStep::succeeded(
            step.step_number,
            &step.tool_id,
            resolved,
            output.data,
            invocation.dry_run,
            output.artifacts,
            started_at,
        ))
    }

    fn finish(&self, step: ExecutedStep) -> StepOutcome {
        telemetry::record_step(&step.tool_id, step.status, step.dry_run);
        StepOutcome::Executed(step)
    }
}
