// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Run requests and their validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::application::error::EngineError;
use crate::domain::autonomy::AutonomyLevel;
use crate::domain::config::{EngineConfig, MAX_GOAL_CHARS, MAX_RUN_TIMEOUT, MAX_STEPS_LIMIT};
use crate::domain::run::IdempotencyKey;

/// What a caller submits to start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub actor: String,
    pub goal: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Honored only for actors allowed to override autonomy.
    #[serde(default)]
    pub autonomy_override: Option<AutonomyLevel>,
}

impl RunRequest {
    pub fn new(actor: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            goal: goal.into(),
            context: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_autonomy_override(mut self, level: AutonomyLevel) -> Self {
        self.autonomy_override = Some(level);
        self
    }

    /// Check shape and ranges, filling defaults from the configuration.
    pub fn validate(self, config: &EngineConfig) -> Result<ValidatedRequest, EngineError> {
        let actor = self.actor.trim().to_string();
        if actor.is_empty() {
            return Err(EngineError::Validation("actor must not be empty".into()));
        }
        if self.goal.trim().is_empty() {
            return Err(EngineError::Validation("goal must not be empty".into()));
        }
        let goal_chars = self.goal.chars().count();
        if goal_chars > MAX_GOAL_CHARS {
            return Err(EngineError::Validation(format!(
                "goal is {goal_chars} characters, limit is {MAX_GOAL_CHARS}"
            )));
        }
        if !(self.context.is_object() || self.context.is_null()) {
            return Err(EngineError::Validation("context must be a JSON object".into()));
        }

        let max_steps = self.max_steps.unwrap_or(config.spec.execution.default_max_steps);
        if !(1..=MAX_STEPS_LIMIT).contains(&max_steps) {
            return Err(EngineError::Validation(format!(
                "max_steps must be within 1..={MAX_STEPS_LIMIT}, got {max_steps}"
            )));
        }

        let timeout = self.timeout.unwrap_or(config.spec.execution.default_timeout);
        if timeout < Duration::from_secs(1) || timeout > MAX_RUN_TIMEOUT {
            return Err(EngineError::Validation(format!(
                "timeout must be within 1s..={}s, got {}ms",
                MAX_RUN_TIMEOUT.as_secs(),
                timeout.as_millis()
            )));
        }

        let idempotency_key = self
            .idempotency_key
            .map(IdempotencyKey::new)
            .transpose()
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let context = if self.context.is_null() {
            Value::Object(Default::default())
        } else {
            self.context
        };

        Ok(ValidatedRequest {
            actor,
            goal: self.goal,
            context,
            idempotency_key,
            dry_run: self.dry_run,
            max_steps,
            timeout,
            autonomy_override: self.autonomy_override,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub actor: String,
    pub goal: String,
    pub context: Value,
    pub idempotency_key: Option<IdempotencyKey>,
    pub dry_run: bool,
    pub max_steps: u32,
    pub timeout: Duration,
    pub autonomy_override: Option<AutonomyLevel>,
}
