// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Progress evaluation records exchanged between the reflection oracle, the
//! reflector policy and the control loop.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Replan,
    Done,
    Failed,
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NextAction::Continue => "continue",
            NextAction::Replan => "replan",
            NextAction::Done => "done",
            NextAction::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    pub goal_achieved: bool,
    pub next_action: NextAction,
    pub reasoning: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Reflection {
    pub fn new(goal_achieved: bool, next_action: NextAction, reasoning: impl Into<String>) -> Self {
        Self {
            goal_achieved,
            next_action,
            reasoning: reasoning.into(),
            issues: Vec::new(),
        }
    }

    pub fn achieved(reasoning: impl Into<String>) -> Self {
        Self::new(true, NextAction::Done, reasoning)
    }

    pub fn proceed(reasoning: impl Into<String>) -> Self {
        Self::new(false, NextAction::Continue, reasoning)
    }

    pub fn replan(reasoning: impl Into<String>) -> Self {
        Self::new(false, NextAction::Replan, reasoning)
    }

    pub fn unrecoverable(reasoning: impl Into<String>) -> Self {
        Self::new(false, NextAction::Failed, reasoning)
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }
}
