// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Actor Policy
//!
//! Which tools an actor may invoke, how much autonomy it gets by default,
//! whether it may override the resolved autonomy, and its admission quota.
//! Policies are keyed by actor pattern:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `admin` | exactly `admin` |
//! | `user_*` | any actor starting with `user_` |
//! | `*` | every actor |
//!
//! When several patterns match, the most specific wins: an exact pattern
//! beats any wildcard, a longer prefix beats a shorter one.
//!
//! Tool scopes use `*` (everything), an exact tool id, or `prefix.*`
//! (every tool id below `prefix.`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::autonomy::AutonomyLevel;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorPolicy {
    pub pattern: String,
    pub scopes: Vec<String>,
    /// Autonomy applied when no override or forced level takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_autonomy: Option<AutonomyLevel>,
    #[serde(default)]
    pub can_override_autonomy: bool,
    /// Requests per rate window; falls back to the guard's default quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

impl ActorPolicy {
    pub fn new(pattern: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            pattern: pattern.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            default_autonomy: None,
            can_override_autonomy: false,
            rate_limit: None,
        }
    }

    pub fn with_default_autonomy(mut self, level: AutonomyLevel) -> Self {
        self.default_autonomy = Some(level);
        self
    }

    pub fn with_override(mut self) -> Self {
        self.can_override_autonomy = true;
        self
    }

    pub fn with_rate_limit(mut self, per_window: u32) -> Self {
        self.rate_limit = Some(per_window);
        self
    }

    pub fn matches_actor(&self, actor: &str) -> bool {
        pattern_matches(&self.pattern, actor)
    }

    pub fn allows_tool(&self, tool_id: &str) -> bool {
        self.scopes.iter().any(|granted| scope_matches(tool_id, granted))
    }

    /// Higher is more specific. Exact patterns outrank every wildcard.
    fn specificity(&self) -> usize {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => prefix.len(),
            None => usize::MAX,
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let body = self.pattern.strip_suffix('*').unwrap_or(&self.pattern);
        if self.pattern.is_empty() || body.contains('*') {
            return Err(PolicyError::InvalidPattern(self.pattern.clone()));
        }
        for scope in &self.scopes {
            let body = wildcard_prefix(scope).unwrap_or(scope);
            if scope.is_empty() || (scope != "*" && body.contains('*')) {
                return Err(PolicyError::InvalidPattern(scope.clone()));
            }
        }
        Ok(())
    }
}

/// Actor pattern match: exact, or trailing-`*` prefix.
pub fn pattern_matches(pattern: &str, actor: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => actor.starts_with(prefix),
        None => pattern == actor,
    }
}

/// `notion.*` and `notion:*` both grant everything under `notion`.
fn wildcard_prefix(scope: &str) -> Option<&str> {
    scope.strip_suffix(".*").or_else(|| scope.strip_suffix(":*"))
}

/// Whether a granted scope covers a tool id.
pub fn scope_matches(tool_id: &str, granted: &str) -> bool {
    if granted == "*" || granted == tool_id {
        return true;
    }
    match wildcard_prefix(granted) {
        Some(prefix) => tool_id
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(['.', ':'])),
        None => false,
    }
}

/// The most specific policy matching `actor`.
pub fn policy_for<'a>(policies: &'a [ActorPolicy], actor: &str) -> Option<&'a ActorPolicy> {
    policies
        .iter()
        .filter(|p| p.matches_actor(actor))
        .max_by_key(|p| p.specificity())
}
