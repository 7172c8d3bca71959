// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory working memory store with a per-run expiry fixed at creation.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::memory::{MemoryError, WorkingMemory, WorkingMemoryStore};
use crate::domain::reflection::Reflection;
use crate::domain::run::RunId;

struct StoredMemory {
    memory: WorkingMemory,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct InMemoryWorkingMemoryStore {
    entries: Arc<DashMap<RunId, StoredMemory>>,
}

impl InMemoryWorkingMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a live entry. An expired entry is removed and reported.
    fn with_live<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut WorkingMemory) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let now = Instant::now();
        match self.entries.get_mut(&run_id) {
            None => return Err(MemoryError::NotFound(run_id)),
            Some(mut stored) => {
                if now < stored.expires_at {
                    return f(&mut stored.memory);
                }
            }
        }
        self.entries.remove(&run_id);
        Err(MemoryError::Expired(run_id))
    }
}

#[async_trait]
impl WorkingMemoryStore for InMemoryWorkingMemoryStore {
    async fn create(&self, memory: WorkingMemory, ttl: Duration) -> Result<(), MemoryError> {
        self.entries.insert(
            memory.run_id,
            StoredMemory {
                memory,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<WorkingMemory, MemoryError> {
        self.with_live(run_id, |memory| Ok(memory.clone()))
    }

    async fn append(&self, run_id: RunId, key: &str, value: Value) -> Result<(), MemoryError> {
        self.with_live(run_id, |memory| memory.insert(key, value))
    }

    async fn set_reflection(&self, run_id: RunId, reflection: Reflection) -> Result<(), MemoryError> {
        self.with_live(run_id, |memory| {
            memory.set_reflection(reflection);
            Ok(())
        })
    }

    async fn remove(&self, run_id: RunId) -> Result<(), MemoryError> {
        self.entries.remove(&run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_memory_expires() {
        let store = InMemoryWorkingMemoryStore::new();
        let run_id = RunId::new();
        store
            .create(WorkingMemory::new(run_id, json!({})), Duration::from_secs(30))
            .await
            .unwrap();
        store.append(run_id, "step1", json!({"ok": true})).await.unwrap();
        assert_eq!(store.load(run_id).await.unwrap().get("step1"), Some(&json!({"ok": true})));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.append(run_id, "step2", json!(1)).await, Err(MemoryError::Expired(run_id)));
        assert_eq!(store.load(run_id).await.unwrap_err(), MemoryError::NotFound(run_id));
    }

    #[tokio::test]
    async fn test_append_never_overwrites() {
        let store = InMemoryWorkingMemoryStore::new();
        let run_id = RunId::new();
        store
            .create(WorkingMemory::new(run_id, json!({})), Duration::from_secs(30))
            .await
            .unwrap();
        store.append(run_id, "step1", json!(1)).await.unwrap();
        assert_eq!(
            store.append(run_id, "step1", json!(2)).await,
            Err(MemoryError::KeyExists("step1".into()))
        );
        assert_eq!(store.load(run_id).await.unwrap().get("step1"), Some(&json!(1)));
    }
}
