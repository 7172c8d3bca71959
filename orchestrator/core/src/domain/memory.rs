// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Working Memory
//!
//! Per-run key/value store of step outputs consumed by template resolution.
//! Entries are additive: once `step<N>` is written it is never overwritten.
//! The only replaceable slot is the last reflection.
//!
//! Persistence is delegated to a [`WorkingMemoryStore`] which owns the TTL.
//! The control loop loads a snapshot before each step and commits successful
//! outputs back; an expired store entry fails the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::reflection::Reflection;
use crate::domain::run::{RunId, StepError};
use crate::domain::template;

/// Reserved key holding the request context.
pub const CONTEXT_KEY: &str = "context";

pub fn step_key(step_number: u32) -> String {
    format!("step{step_number}")
}

/// The value stored under `step<N>`: the tool output wrapped as
/// `{"result": output}`, so templates read `step<N>.result...`.
pub fn step_entry(output: Value) -> Value {
    let mut entry = serde_json::Map::with_capacity(1);
    entry.insert("result".to_string(), output);
    Value::Object(entry)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub run_id: RunId,
    entries: BTreeMap<String, Value>,
    last_reflection: Option<Reflection>,
}

impl WorkingMemory {
    pub fn new(run_id: RunId, context: Value) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(CONTEXT_KEY.to_string(), context);
        Self {
            run_id,
            entries,
            last_reflection: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), MemoryError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(MemoryError::KeyExists(key));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn record_step_output(&mut self, step_number: u32, output: Value) -> Result<(), MemoryError> {
        self.insert(step_key(step_number), step_entry(output))
    }

    pub fn last_reflection(&self) -> Option<&Reflection> {
        self.last_reflection.as_ref()
    }

    pub fn set_reflection(&mut self, reflection: Reflection) {
        self.last_reflection = Some(reflection);
    }

    /// Resolve `{{path}}` placeholders in a step input against this memory.
    pub fn resolve(&self, input: &Value) -> Result<Value, StepError> {
        template::resolve(input, &|root: &str| self.entries.get(root))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("Working memory for run {0} has expired")]
    Expired(RunId),

    #[error("No working memory for run {0}")]
    NotFound(RunId),

    #[error("Working memory key '{0}' is already written")]
    KeyExists(String),
}

/// Persistence collaborator owning working memory and its expiry.
#[async_trait]
pub trait WorkingMemoryStore: Send + Sync {
    /// Store a fresh memory that expires `ttl` from now.
    async fn create(&self, memory: WorkingMemory, ttl: Duration) -> Result<(), MemoryError>;

    async fn load(&self, run_id: RunId) -> Result<WorkingMemory, MemoryError>;

    /// Add an entry. Fails with `KeyExists` rather than overwrite.
    async fn append(&self, run_id: RunId, key: &str, value: Value) -> Result<(), MemoryError>;

    async fn set_reflection(&self, run_id: RunId, reflection: Reflection) -> Result<(), MemoryError>;

    async fn remove(&self, run_id: RunId) -> Result<(), MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_are_additive() {
        let mut memory = WorkingMemory::new(RunId::new(), json!({}));
        memory.record_step_output(1, json!({"a": 1})).unwrap();
        assert_eq!(
            memory.record_step_output(1, json!({"a": 2})),
            Err(MemoryError::KeyExists("step1".into()))
        );
        assert_eq!(memory.get("step1"), Some(&json!({"result": {"a": 1}})));
    }

    #[test]
    fn test_context_is_seeded_and_resolvable() {
        let memory = WorkingMemory::new(RunId::new(), json!({"channel": "#ops"}));
        assert!(memory.contains(CONTEXT_KEY));
        assert_eq!(memory.resolve(&json!("{{context.channel}}")).unwrap(), json!("#ops"));
    }

    #[test]
    fn test_reflection_slot_is_replaced() {
        let mut memory = WorkingMemory::new(RunId::new(), Value::Null);
        memory.set_reflection(Reflection::proceed("first"));
        memory.set_reflection(Reflection::achieved("second"));
        assert_eq!(memory.last_reflection().map(|r| r.reasoning.as_str()), Some("second"));
    }
}
