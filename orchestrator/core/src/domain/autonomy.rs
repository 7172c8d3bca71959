// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Autonomy Levels
//!
//! How much human approval a run needs before side effects occur. The level is
//! resolved once per run and never changes afterwards.
//!
//! | Level | Gate |
//! |-------|------|
//! | `Ask` | every step waits for an explicit approval |
//! | `Draft` | the plan runs once as a dry run, then one plan-level approval gates the real pass |
//! | `ExecuteNotify` | steps run unattended, observers are notified |
//! | `ExecuteSilent` | steps run unattended, no notifications |
//!
//! Variants are declared from most to least conservative, so the derived
//! `Ord` reads as "permissiveness": `Ask < Draft < ExecuteNotify < ExecuteSilent`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Ask,
    Draft,
    ExecuteNotify,
    ExecuteSilent,
}

impl AutonomyLevel {
    /// Levels whose steps are executed as one approved batch and reflected on
    /// once the batch ends.
    pub fn is_batch_gated(self) -> bool {
        matches!(self, AutonomyLevel::Ask | AutonomyLevel::Draft)
    }

    pub fn notifies(self) -> bool {
        matches!(self, AutonomyLevel::ExecuteNotify)
    }

    /// The more conservative of two levels.
    pub fn most_conservative(self, other: AutonomyLevel) -> AutonomyLevel {
        self.min(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyLevel::Ask => "ask",
            AutonomyLevel::Draft => "draft",
            AutonomyLevel::ExecuteNotify => "execute_notify",
            AutonomyLevel::ExecuteSilent => "execute_silent",
        }
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown autonomy level: {0}")]
pub struct UnknownAutonomyLevel(pub String);

impl FromStr for AutonomyLevel {
    type Err = UnknownAutonomyLevel;

    /// Accepts the snake_case names and the legacy `L0_Ask`..`L3_ExecuteSilent` labels.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" | "L0_Ask" => Ok(AutonomyLevel::Ask),
            "draft" | "L1_Draft" => Ok(AutonomyLevel::Draft),
            "execute_notify" | "L2_ExecuteNotify" => Ok(AutonomyLevel::ExecuteNotify),
            "execute_silent" | "L3_ExecuteSilent" => Ok(AutonomyLevel::ExecuteSilent),
            other => Err(UnknownAutonomyLevel(other.to_string())),
        }
    }
}
