// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end runs under autonomous levels: admission, templating, replans,
//! budgets and deadlines.

mod common;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{always_failing_planner, low_risk, step, test_config, Harness, RecordingTool, ScriptedPlanner};
use taskpilot_core::application::{EngineError, RunRequest, RunService};
use taskpilot_core::audit::{ApprovalOutcome, AuditEntry};
use taskpilot_core::autonomy::AutonomyLevel;
use taskpilot_core::events::RunEvent;
use taskpilot_core::planner::PlanningError;
use taskpilot_core::policy::ActorPolicy;
use taskpilot_core::run::{RunFailure, RunStatus, StepError, StepStatus};
use taskpilot_core::state::{ApprovalScope, Phase};

const WAIT: Duration = Duration::from_secs(5);

fn digest_plan() -> Vec<taskpilot_core::plan::Step> {
    vec![
        step(1, "local.echo", json!({"summary": "weekly digest"})),
        step(2, "notion.publish", json!({"parent": "{{step1.result.id}}", "title": "Digest"})),
        step(3, "local.echo", json!({"note": "published"})),
    ]
}

#[tokio::test]
async fn test_three_step_run_completes_with_templated_input() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![digest_plan()]));

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Publish the weekly digest"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.autonomy_level, Some(AutonomyLevel::ExecuteSilent));
    assert_eq!(result.executed_steps.len(), 3);
    assert_eq!(result.replan_count, 0);
    assert!(result.error.is_none());
    assert_eq!(
        result.executed_steps[1].resolved_input,
        json!({"parent": "local.echo#1", "title": "Digest"})
    );
    assert_eq!(result.artifacts.len(), 3);
    assert!(result.final_reflection.as_ref().is_some_and(|r| r.goal_achieved));
    assert_eq!(
        harness.effects(),
        vec!["local.echo:1", "notion.publish:2", "local.echo:3"]
    );

    let transitions = harness.audit.transitions(run_id);
    assert_eq!(transitions.first(), Some(&(Phase::Initialize, Phase::Plan)));
    assert_eq!(transitions.last(), Some(&(Phase::Reflect, Phase::Finalize)));
    assert_eq!(harness.audit.steps(run_id).len(), 3);
    assert_eq!(harness.audit.result(run_id).map(|r| r.status), Some(RunStatus::Completed));

    let status = harness.service.get_run_status(run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Completed);
    assert_eq!(status.steps_executed, 3);
    assert!(status.completed_at.is_some());
}

#[tokio::test]
async fn test_failed_step_triggers_replan_numbered_after_history() {
    let planner = ScriptedPlanner::new(vec![
        vec![
            step(1, "local.echo", json!({"summary": "draft"})),
            step(2, "notion.publish", json!({"fail": true})),
        ],
        vec![
            step(3, "local.echo", json!({"summary": "retry"})),
            step(4, "notion.publish", json!({"parent": "{{step3.result.id}}"})),
        ],
    ]);
    let harness = Harness::new(test_config(), planner);

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Publish despite a flaky step"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.replan_count, 1);
    let numbers: Vec<u32> = result.executed_steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(result.executed_steps[1].status, StepStatus::Failed);
    assert!(matches!(
        result.executed_steps[1].error,
        Some(StepError::ToolExecution { ref tool_id, .. }) if tool_id == "notion.publish"
    ));

    let requests = harness.planner.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].is_replan());
    assert_eq!(requests[1].plan_version, 2);
    assert_eq!(requests[1].next_step_number, 3);
    assert_eq!(requests[1].executed_steps.len(), 2);
    assert!(requests[1].reflection.is_some());
}

#[tokio::test]
async fn test_replan_budget_exhaustion_fails_run() {
    let harness = Harness::new(test_config(), always_failing_planner());

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Never works"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure, Some(RunFailure::ReplanBudgetExhausted { max_replans: 3 }));
    assert_eq!(result.replan_count, 3);
    assert_eq!(result.executed_steps.len(), 4);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_planning_errors_retry_then_fail() {
    let planner = ScriptedPlanner::with_results(vec![
        Err(PlanningError::Oracle("model overloaded".into())),
        Ok(vec![step(1, "local.echo", json!({}))]),
    ]);
    let harness = Harness::new(test_config(), planner);
    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Recover from a planner hiccup"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.replan_count, 1);

    let mut config = test_config();
    config.spec.execution.max_replans = 0;
    let planner = ScriptedPlanner::with_results(vec![Err(PlanningError::Oracle("model overloaded".into()))]);
    let harness = Harness::new(config, planner);
    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Planner never answers"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert!(matches!(result.failure, Some(RunFailure::Planning { .. })));
}

#[tokio::test]
async fn test_rate_limit_rejects_before_run_exists() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![vec![step(1, "local.echo", json!({}))]]));
    let mut events = harness.service.events().subscribe();

    let first = harness
        .service
        .create_run(RunRequest::new("limited_bot", "First"))
        .await
        .unwrap();
    let second = harness
        .service
        .create_run(RunRequest::new("limited_bot", "Second"))
        .await;

    assert!(matches!(second, Err(EngineError::RateLimited { .. })));
    let runs = harness.service.list_runs_for_actor("limited_bot").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, first);

    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::AdmissionRejected { actor, .. } = event {
            assert_eq!(actor, "limited_bot");
            rejected += 1;
        }
    }
    assert_eq!(rejected, 1);
}

#[tokio::test]
async fn test_duplicate_idempotency_key_returns_existing_run() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![vec![step(1, "local.echo", json!({}))]]));
    let request = || RunRequest::new("silent_digest", "Digest").with_idempotency_key("digest-2026-10-16");

    let first = harness.service.create_run(request()).await.unwrap();
    match harness.service.create_run(request()).await {
        Err(EngineError::DuplicateRequest { existing_run_id }) => assert_eq!(existing_run_id, first),
        other => panic!("expected duplicate, got {other:?}"),
    }

    let found = harness
        .service
        .find_by_idempotency_key("digest-2026-10-16")
        .await
        .unwrap()
        .expect("run is indexed by its key");
    assert_eq!(found.id, first);
    assert_eq!(harness.service.list_runs_for_actor("silent_digest").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![]));

    let unknown = harness.service.create_run(RunRequest::new("stranger", "Anything")).await;
    assert!(matches!(unknown, Err(EngineError::PolicyViolation(_))));

    let blank = harness.service.create_run(RunRequest::new("silent_digest", "   ")).await;
    assert!(matches!(blank, Err(EngineError::Validation(_))));

    let zero_steps = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Digest").with_max_steps(0))
        .await;
    assert!(matches!(zero_steps, Err(EngineError::Validation(_))));

    let array_context = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Digest").with_context(json!([1, 2])))
        .await;
    assert!(matches!(array_context, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_out_of_scope_tool_fails_with_policy_violation() {
    let planner = ScriptedPlanner::new(vec![vec![
        step(1, "local.echo", json!({})),
        step(2, "notion.publish", json!({})),
    ]]);
    let harness = Harness::new(test_config(), planner);

    let run_id = harness
        .service
        .create_run(RunRequest::new("limited_bot", "Publish outside my scope"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(result.failure, Some(RunFailure::PolicyViolation { .. })));
    assert!(result.executed_steps.is_empty());
    assert!(harness.effects().is_empty());
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![digest_plan()]));

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Rehearse the digest").dry_run())
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.executed_steps.len(), 3);
    assert!(result.executed_steps.iter().all(|s| s.dry_run && s.is_success()));
    assert!(result.artifacts.is_empty());
    assert!(harness.effects().is_empty());
    assert_eq!(
        result.executed_steps[1].resolved_input["parent"],
        json!("local.echo#1")
    );
}

#[tokio::test]
async fn test_dry_run_rejects_tools_without_simulation() {
    let harness = Harness::with_tools(
        test_config(),
        ScriptedPlanner::new(vec![vec![step(1, "mail.send", json!({"to": "team"}))]]),
        |tools, _| {
            let metadata = taskpilot_core::tool::ToolMetadata {
                dry_run_supported: false,
                ..low_risk()
            };
            tools.push(RecordingTool::new("mail.send", metadata, Arc::default()));
        },
    );

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Rehearse an email").dry_run())
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        result.executed_steps[0].error,
        Some(StepError::DryRunUnsupported { .. })
    ));
}

#[tokio::test]
async fn test_step_limit_stops_the_run() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![digest_plan()]));

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Too many steps").with_max_steps(2))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure, Some(RunFailure::StepLimitReached { max_steps: 2 }));
    assert_eq!(result.executed_steps.len(), 2);
    assert_eq!(harness.effects().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_working_memory_expiry_fails_the_run() {
    let mut config = test_config();
    config.spec.memory.ttl = Duration::from_secs(1);
    let harness = Harness::with_tools(
        config,
        ScriptedPlanner::new(vec![vec![step(1, "slow.fetch", json!({})), step(2, "local.echo", json!({}))]]),
        |tools, _| {
            tools.push(RecordingTool::new("slow.fetch", low_risk(), Arc::default()).with_delay(Duration::from_secs(2)));
        },
    );

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Outlive my memory"))
        .await
        .unwrap();
    let result = harness
        .service
        .wait_for_completion(run_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure, Some(RunFailure::WorkingMemoryExpired));
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_interrupts_cancellable_tool() {
    let harness = Harness::with_tools(
        test_config(),
        ScriptedPlanner::new(vec![vec![step(1, "slow.fetch", json!({}))]]),
        |tools, _| {
            tools.push(RecordingTool::new("slow.fetch", low_risk(), Arc::default()).with_delay(Duration::from_secs(30)));
        },
    );

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Slow fetch").with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    let result = harness
        .service
        .wait_for_completion(run_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure, Some(RunFailure::Timeout { limit_secs: 2 }));
    assert!(result.executed_steps.first().is_some_and(|s| s.timed_out()));
}

#[tokio::test]
async fn test_notify_autonomy_emits_step_notifications() {
    let planner = ScriptedPlanner::new(vec![vec![
        step(1, "local.echo", json!({})),
        step(2, "local.echo", json!({})),
    ]]);
    let harness = Harness::new(test_config(), planner);
    let mut events = harness.service.events().subscribe();

    let run_id = harness
        .service
        .create_run(RunRequest::new("notify_digest", "Tell me as you go"))
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert_eq!(result.autonomy_level, Some(AutonomyLevel::ExecuteNotify));

    let mut notified = Vec::new();
    let mut finalized = false;
    while let Ok(event) = events.try_recv() {
        match event {
            RunEvent::StepNotification { run_id: id, step_number, .. } if id == run_id => {
                notified.push(step_number)
            }
            RunEvent::RunFinalized { run_id: id, status, .. } if id == run_id => {
                assert_eq!(status, RunStatus::Completed);
                finalized = true;
            }
            _ => {}
        }
    }
    assert_eq!(notified, vec![1, 2]);
    assert!(finalized);
}

#[tokio::test]
async fn test_silent_autonomy_emits_no_notifications() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![vec![step(1, "local.echo", json!({}))]]));
    let mut events = harness.service.events().subscribe();

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Quietly"))
        .await
        .unwrap();
    harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, RunEvent::StepNotification { .. }));
    }
}

#[tokio::test]
async fn test_cancel_finished_run_is_rejected() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![vec![step(1, "local.echo", json!({}))]]));
    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Quick"))
        .await
        .unwrap();
    harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    let cancelled = harness.service.cancel_run(run_id, None).await;
    assert!(matches!(cancelled, Err(EngineError::Validation(_))));
}

fn refund_tool(effects: &Arc<Mutex<Vec<String>>>) -> RecordingTool {
    let metadata = taskpilot_core::tool::ToolMetadata {
        requires_approval: true,
        ..low_risk()
    };
    RecordingTool::new("billing.refund", metadata, effects.clone())
}

fn refund_after_failure() -> ScriptedPlanner {
    ScriptedPlanner::new(vec![
        vec![step(1, "local.echo", json!({"fail": true}))],
        vec![step(2, "billing.refund", json!({"amount": 40}))],
    ])
}

#[tokio::test]
async fn test_replan_into_approval_tool_waits_for_plan_approval() {
    let harness = Harness::with_tools(test_config(), refund_after_failure(), |tools, effects| {
        tools.push(refund_tool(effects))
    });

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_support", "Refund the duplicate charge"))
        .await
        .unwrap();

    let pending = harness.pending_for(run_id).await;
    assert_eq!(pending.scope, ApprovalScope::Plan { plan_version: 2 });
    assert!(pending.preview.is_empty());
    assert!(harness.effects().is_empty());

    harness
        .service
        .approve(run_id, Some("finance".into()), None)
        .await
        .unwrap();

    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.autonomy_level, Some(AutonomyLevel::ExecuteSilent));
    assert_eq!(result.replan_count, 1);
    assert_eq!(harness.effects(), vec!["billing.refund:2"]);

    let entries = harness.audit.entries(run_id);
    let granted = entries
        .iter()
        .position(|e| {
            matches!(e, AuditEntry::Approval { approval, .. }
                if approval.outcome == ApprovalOutcome::Granted
                    && approval.scope == ApprovalScope::Plan { plan_version: 2 })
        })
        .expect("plan grant recorded");
    let refunded = entries
        .iter()
        .position(|e| matches!(e, AuditEntry::Step { step, .. } if step.tool_id == "billing.refund"))
        .expect("refund recorded");
    assert!(granted < refunded);
    assert_eq!(harness.audit.approvals(run_id)[1].decided_by.as_deref(), Some("finance"));
}

#[tokio::test]
async fn test_rejected_replan_never_runs_approval_tool() {
    let harness = Harness::with_tools(test_config(), refund_after_failure(), |tools, effects| {
        tools.push(refund_tool(effects))
    });

    let run_id = harness
        .service
        .create_run(RunRequest::new("notify_support", "Refund the duplicate charge"))
        .await
        .unwrap();
    harness.pending_for(run_id).await;
    harness
        .service
        .reject(run_id, "needs a ticket".into(), Some("finance".into()))
        .await
        .unwrap();

    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert!(matches!(result.failure, Some(RunFailure::ApprovalRejected { .. })));
    assert!(harness.effects().is_empty());
    assert!(result.executed_steps.iter().all(|s| s.tool_id != "billing.refund"));
}

#[tokio::test]
async fn test_honored_override_runs_approval_tool_without_asking() {
    let mut config = test_config();
    config.spec.actors.insert(
        0,
        ActorPolicy::new("admin_*", &["*"])
            .with_default_autonomy(AutonomyLevel::Ask)
            .with_override(),
    );
    let harness = Harness::with_tools(config, refund_after_failure(), |tools, effects| {
        tools.push(refund_tool(effects))
    });

    let run_id = harness
        .service
        .create_run(
            RunRequest::new("admin_ops", "Refund the duplicate charge")
                .with_autonomy_override(AutonomyLevel::ExecuteSilent),
        )
        .await
        .unwrap();
    let result = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(harness.effects(), vec!["billing.refund:2"]);
    assert!(harness.audit.approvals(run_id).is_empty());
}

#[tokio::test]
async fn test_finished_runs_release_their_handle() {
    let harness = Harness::new(test_config(), ScriptedPlanner::new(vec![digest_plan()]));

    let run_id = harness
        .service
        .create_run(RunRequest::new("silent_digest", "Publish the weekly digest"))
        .await
        .unwrap();
    let live = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();

    for _ in 0..100 {
        if harness.service.live_runs() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.service.live_runs(), 0);

    let stored = harness.service.wait_for_completion(run_id, WAIT).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.executed_steps.len(), live.executed_steps.len());
    assert_eq!(stored.final_reflection, live.final_reflection);
    assert!(stored.final_reflection.is_some_and(|r| r.goal_achieved));
    assert!(matches!(
        harness.service.cancel_run(run_id, None).await,
        Err(EngineError::Validation(_))
    ));
}
