// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Plans
//!
//! A [`Plan`] is the ordered step list produced by the planning oracle. The
//! oracle is untrusted, so every plan is validated before the control loop
//! accepts it. Step numbers are run-global: the initial plan is numbered
//! `1..=n`, a replacement plan continues at the run's next step number.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::template;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    pub tool_id: String,
    /// May contain unresolved `{{path}}` placeholders.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub purpose: String,
}

impl Step {
    pub fn new(step_number: u32, tool_id: impl Into<String>, input: Value) -> Self {
        Self {
            step_number,
            tool_id: tool_id.into(),
            input,
            purpose: String::new(),
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// 1 for the initial plan, incremented on every accepted replan.
    pub version: u32,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("Plan contains no steps")]
    Empty,

    #[error("Step {step_number} has an empty tool id")]
    EmptyToolId { step_number: u32 },

    #[error("Expected step number {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("Step {step_number} references '{path}' which is not produced by an earlier step")]
    ForwardReference { step_number: u32, path: String },
}

impl Plan {
    pub fn new(version: u32, steps: Vec<Step>) -> Self {
        Self { version, steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.tool_id.as_str())
    }

    /// Structural validation against the run's next free step number.
    pub fn validate(&self, next_step_number: u32) -> Result<(), PlanValidationError> {
        if self.steps.is_empty() {
            return Err(PlanValidationError::Empty);
        }
        for (offset, step) in self.steps.iter().enumerate() {
            let expected = next_step_number + offset as u32;
            if step.step_number != expected {
                return Err(PlanValidationError::NonContiguous {
                    expected,
                    found: step.step_number,
                });
            }
            if step.tool_id.trim().is_empty() {
                return Err(PlanValidationError::EmptyToolId {
                    step_number: step.step_number,
                });
            }
            for path in template::referenced_paths(&step.input) {
                if let Some(referenced) = template::root_step_number(&path) {
                    if referenced >= step.step_number {
                        return Err(PlanValidationError::ForwardReference {
                            step_number: step.step_number,
                            path,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
