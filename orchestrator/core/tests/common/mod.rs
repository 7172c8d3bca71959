// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures: a scripted planner, a recording tool and a service
//! wired to in-memory components.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use taskpilot_core::application::reflector::HeuristicReflectionOracle;
use taskpilot_core::application::{EngineComponents, RunService, StandardRunService};
use taskpilot_core::autonomy::AutonomyLevel;
use taskpilot_core::config::EngineConfig;
use taskpilot_core::infrastructure::audit_log::InMemoryAuditLog;
use taskpilot_core::infrastructure::tool_registry::ToolRegistry;
use taskpilot_core::infrastructure::PendingApprovalInfo;
use taskpilot_core::plan::{Plan, Step};
use taskpilot_core::planner::{Planner, PlanningError, PlanningRequest, ReflectionOracle};
use taskpilot_core::policy::ActorPolicy;
use taskpilot_core::run::RunId;
use taskpilot_core::tool::{Artifact, Tool, ToolContext, ToolError, ToolMetadata, ToolOutput};

/// Returns queued step lists in order; the last one repeats once the queue
/// runs dry.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Result<Vec<Step>, PlanningError>>>,
    repeat_last: Mutex<Option<Vec<Step>>>,
    pub requests: Mutex<Vec<PlanningRequest>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Vec<Step>>) -> Self {
        Self {
            plans: Mutex::new(plans.into_iter().map(Ok).collect()),
            repeat_last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_results(results: Vec<Result<Vec<Step>, PlanningError>>) -> Self {
        Self {
            plans: Mutex::new(results.into_iter().collect()),
            repeat_last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PlanningRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn generate(&self, request: &PlanningRequest) -> Result<Plan, PlanningError> {
        self.requests.lock().push(request.clone());
        let next = self.plans.lock().pop_front();
        let steps = match next {
            Some(Ok(steps)) => {
                *self.repeat_last.lock() = Some(steps.clone());
                steps
            }
            Some(Err(e)) => return Err(e),
            None => self
                .repeat_last
                .lock()
                .clone()
                .ok_or_else(|| PlanningError::Oracle("no plan scripted".into()))?,
        };
        // Renumber repeated plans from the requested step number.
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, mut s)| {
                s.step_number = request.next_step_number + i as u32;
                s
            })
            .collect();
        Ok(Plan::new(request.plan_version, steps))
    }
}

/// Planner that produces one plan whose every step fails.
pub fn always_failing_planner() -> ScriptedPlanner {
    ScriptedPlanner::new(vec![vec![Step::new(1, "local.echo", json!({"fail": true}))]])
}

/// Tool whose real invocations are logged to `effects`.
pub struct RecordingTool {
    id: String,
    metadata: ToolMetadata,
    effects: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl RecordingTool {
    pub fn new(id: &str, metadata: ToolMetadata, effects: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            id: id.to_string(),
            metadata,
            effects,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput, ToolError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if input.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ToolError::Execution(format!("{} refused step {}", self.id, ctx.step_number)));
        }
        let data = json!({"id": format!("{}#{}", self.id, ctx.step_number), "echo": input});
        let artifact = Artifact::new("record", format!("mem://{}/{}", ctx.run_id, ctx.step_number), &self.id);
        if ctx.dry_run {
            return Ok(ToolOutput::simulated(data).with_artifact(artifact));
        }
        self.effects.lock().push(format!("{}:{}", self.id, ctx.step_number));
        Ok(ToolOutput::new(data).with_artifact(artifact))
    }
}

pub fn low_risk() -> ToolMetadata {
    ToolMetadata {
        dry_run_supported: true,
        idempotent: true,
        cancellable: true,
        ..Default::default()
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.spec.actors = vec![
        ActorPolicy::new("silent_*", &["*"]).with_default_autonomy(AutonomyLevel::ExecuteSilent),
        ActorPolicy::new("notify_*", &["*"]).with_default_autonomy(AutonomyLevel::ExecuteNotify),
        ActorPolicy::new("ask_*", &["*"]).with_default_autonomy(AutonomyLevel::Ask),
        ActorPolicy::new("draft_*", &["*"]).with_default_autonomy(AutonomyLevel::Draft),
        ActorPolicy::new("limited_*", &["local.*"])
            .with_default_autonomy(AutonomyLevel::ExecuteSilent)
            .with_rate_limit(1),
    ];
    config
}

pub struct Harness {
    pub service: StandardRunService,
    pub audit: InMemoryAuditLog,
    pub planner: Arc<ScriptedPlanner>,
    pub effects: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn new(config: EngineConfig, planner: ScriptedPlanner) -> Self {
        Self::with_tools(config, planner, |_, _| {})
    }

    /// Registers `local.echo` and `notion.publish` (both low risk), then lets
    /// the caller add more, optionally sharing the effect log.
    pub fn with_tools(
        config: EngineConfig,
        planner: ScriptedPlanner,
        extra: impl FnOnce(&mut Vec<RecordingTool>, &Arc<Mutex<Vec<String>>>),
    ) -> Self {
        let effects = Arc::new(Mutex::new(Vec::new()));
        let mut tools = vec![
            RecordingTool::new("local.echo", low_risk(), effects.clone()),
            RecordingTool::new("notion.publish", low_risk(), effects.clone()),
        ];
        extra(&mut tools, &effects);

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool)).expect("test tool registers");
        }

        let planner = Arc::new(planner);
        let oracle: Arc<dyn ReflectionOracle> = Arc::new(HeuristicReflectionOracle);
        let (components, audit) = EngineComponents::in_memory();
        let service = StandardRunService::new(
            Arc::new(config),
            planner.clone(),
            oracle,
            Arc::new(registry),
            components,
        );
        Self {
            service,
            audit,
            planner,
            effects,
        }
    }

    pub fn effects(&self) -> Vec<String> {
        self.effects.lock().clone()
    }

    /// Poll until the run has a pending approval.
    pub async fn pending_for(&self, run_id: RunId) -> PendingApprovalInfo {
        for _ in 0..500 {
            let pending = self.service.list_pending_approvals().await;
            if let Some(info) = pending.into_iter().find(|p| p.run_id == run_id) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never asked for approval");
    }
}

pub fn step(n: u32, tool: &str, input: Value) -> Step {
    Step::new(n, tool, input)
}
