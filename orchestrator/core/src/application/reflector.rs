// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Reflector
//!
//! Turns a raw oracle judgement into the control loop's next move. The oracle
//! is untrusted; the policy below always wins:
//!
//! 1. goal achieved (or oracle says done): `Done`, even with steps left
//! 2. oracle says unrecoverable: `Failed`
//! 3. replan requested or the latest step failed: `Replan` while the budget
//!    lasts, otherwise `Failed`
//! 4. steps remain: `Continue`
//! 5. plan exhausted and the latest step succeeded: `Done`
//!
//! When the oracle errors the [`HeuristicReflectionOracle`] answers instead.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::planner::{OracleError, ReflectionOracle, ReflectionRequest};
use crate::domain::reflection::{NextAction, Reflection};
use crate::domain::run::RunFailure;

/// Built-in oracle used when none is configured or the configured one fails.
pub struct HeuristicReflectionOracle;

#[async_trait]
impl ReflectionOracle for HeuristicReflectionOracle {
    async fn evaluate(&self, request: &ReflectionRequest) -> Result<Reflection, OracleError> {
        if request.latest_failed() {
            let reason = request
                .latest
                .as_ref()
                .and_then(|s| s.error.as_ref())
                .map(ToString::to_string)
                .unwrap_or_else(|| "latest step failed".to_string());
            return Ok(Reflection::replan("Latest step failed").with_issue(reason));
        }
        if request.remaining_steps.is_empty() {
            return Ok(Reflection::achieved("Plan ran to completion without failure"));
        }
        Ok(Reflection::proceed(format!(
            "{} step(s) remaining",
            request.remaining_steps.len()
        )))
    }
}

/// The reflector's decision plus the run failure it implies, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub reflection: Reflection,
    pub failure: Option<RunFailure>,
    /// The heuristic answered because the oracle failed.
    pub used_fallback: bool,
}

pub struct Reflector {
    oracle: Arc<dyn ReflectionOracle>,
    fallback: HeuristicReflectionOracle,
    max_replans: u32,
}

impl Reflector {
    pub fn new(oracle: Arc<dyn ReflectionOracle>, max_replans: u32) -> Self {
        Self {
            oracle,
            fallback: HeuristicReflectionOracle,
            max_replans,
        }
    }

    pub async fn reflect(&self, request: &ReflectionRequest, replan_count: u32) -> Judgement {
        let (raw, used_fallback) = match self.oracle.evaluate(request).await {
            Ok(raw) => (raw, false),
            Err(e) => {
                warn!(run_id = %request.run_id, error = %e, "Reflection oracle failed, using heuristic");
                match self.fallback.evaluate(request).await {
                    Ok(raw) => (raw, true),
                    Err(e) => {
                        return Judgement {
                            reflection: Reflection::unrecoverable(e.to_string()),
                            failure: Some(RunFailure::Unrecoverable { reason: e.to_string() }),
                            used_fallback: true,
                        };
                    }
                }
            }
        };

        let judgement = self.apply_policy(raw, request, replan_count);
        let judgement = Judgement { used_fallback, ..judgement };
        info!(
            run_id = %request.run_id,
            next_action = %judgement.reflection.next_action,
            goal_achieved = judgement.reflection.goal_achieved,
            fallback = used_fallback,
            "Reflection complete"
        );
        judgement
    }

    fn apply_policy(&self, raw: Reflection, request: &ReflectionRequest, replan_count: u32) -> Judgement {
        let decided = |reflection: Reflection, failure: Option<RunFailure>| Judgement {
            reflection,
            failure,
            used_fallback: false,
        };

        if raw.goal_achieved || raw.next_action == NextAction::Done {
            return decided(
                Reflection {
                    goal_achieved: true,
                    next_action: NextAction::Done,
                    ..raw
                },
                None,
            );
        }

        if raw.next_action == NextAction::Failed {
            let reason = raw.reasoning.clone();
            return decided(raw, Some(RunFailure::Unrecoverable { reason }));
        }

        if raw.next_action == NextAction::Replan || request.latest_failed() {
            if replan_count < self.max_replans {
                return decided(
                    Reflection {
                        next_action: NextAction::Replan,
                        ..raw
                    },
                    None,
                );
            }
            debug!(run_id = %request.run_id, replan_count, "Replan budget exhausted");
            let issue = format!("replan budget of {} exhausted", self.max_replans);
            return decided(
                Reflection {
                    next_action: NextAction::Failed,
                    ..raw
                }
                .with_issue(issue),
                Some(RunFailure::ReplanBudgetExhausted {
                    max_replans: self.max_replans,
                }),
            );
        }

        if !request.remaining_steps.is_empty() {
            return decided(
                Reflection {
                    next_action: NextAction::Continue,
                    ..raw
                },
                None,
            );
        }

        decided(
            Reflection {
                next_action: NextAction::Done,
                ..raw
            },
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::memory::WorkingMemory;
    use crate::domain::plan::Step;
    use crate::domain::run::{ExecutedStep, RunId, StepError};
    use chrono::Utc;
    use serde_json::json;

    struct FixedOracle(Result<Reflection, OracleError>);

    #[async_trait]
    impl ReflectionOracle for FixedOracle {
        async fn evaluate(&self, _request: &ReflectionRequest) -> Result<Reflection, OracleError> {
            self.0.clone()
        }
    }

    fn request(latest_ok: bool, remaining: usize) -> ReflectionRequest {
        let run_id = RunId::new();
        let latest = if latest_ok {
            ExecutedStep::succeeded(1, "local.echo", json!({}), json!({}), false, vec![], Utc::now())
        } else {
            ExecutedStep::failed(
                1,
                "local.echo",
                json!({}),
                StepError::ToolExecution {
                    tool_id: "local.echo".into(),
                    message: "boom".into(),
                },
                false,
                Utc::now(),
            )
        };
        ReflectionRequest {
            run_id,
            goal: "goal".into(),
            executed_steps: vec![latest.clone()],
            latest: Some(latest),
            remaining_steps: (0..remaining)
                .map(|i| Step::new(i as u32 + 2, "local.echo", json!({})))
                .collect(),
            memory: WorkingMemory::new(run_id, json!({})),
        }
    }

    fn reflector(raw: Result<Reflection, OracleError>, max_replans: u32) -> Reflector {
        Reflector::new(Arc::new(FixedOracle(raw)), max_replans)
    }

    #[tokio::test]
    async fn test_goal_achieved_exits_early() {
        let r = reflector(Ok(Reflection::achieved("all set")), 3);
        let judgement = r.reflect(&request(true, 4), 0).await;
        assert_eq!(judgement.reflection.next_action, NextAction::Done);
        assert!(judgement.failure.is_none());
    }

    #[tokio::test]
    async fn test_failed_step_forces_replan_within_budget() {
        let r = reflector(Ok(Reflection::proceed("looks fine")), 2);
        let judgement = r.reflect(&request(false, 1), 1).await;
        assert_eq!(judgement.reflection.next_action, NextAction::Replan);

        let judgement = r.reflect(&request(false, 1), 2).await;
        assert_eq!(judgement.reflection.next_action, NextAction::Failed);
        assert_eq!(judgement.failure, Some(RunFailure::ReplanBudgetExhausted { max_replans: 2 }));
    }

    #[tokio::test]
    async fn test_continue_requires_remaining_steps() {
        let r = reflector(Ok(Reflection::proceed("keep going")), 3);
        assert_eq!(r.reflect(&request(true, 2), 0).await.reflection.next_action, NextAction::Continue);
        assert_eq!(r.reflect(&request(true, 0), 0).await.reflection.next_action, NextAction::Done);
    }

    #[tokio::test]
    async fn test_unrecoverable_fails_the_run() {
        let r = reflector(Ok(Reflection::unrecoverable("credentials revoked")), 3);
        let judgement = r.reflect(&request(true, 2), 0).await;
        assert_eq!(
            judgement.failure,
            Some(RunFailure::Unrecoverable {
                reason: "credentials revoked".into()
            })
        );
    }

    #[tokio::test]
    async fn test_oracle_failure_falls_back_to_heuristic() {
        let r = reflector(Err(OracleError("timeout".into())), 3);

        let judgement = r.reflect(&request(true, 0), 0).await;
        assert!(judgement.used_fallback);
        assert!(judgement.reflection.goal_achieved);

        let judgement = r.reflect(&request(false, 0), 0).await;
        assert_eq!(judgement.reflection.next_action, NextAction::Replan);

        let judgement = r.reflect(&request(true, 3), 0).await;
        assert_eq!(judgement.reflection.next_action, NextAction::Continue);
    }
}
