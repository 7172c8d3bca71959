// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! In-memory implementations of the repository abstractions defined in the
//! domain layer. Durable backends plug in behind the same traits.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryRunRepository** - `Run` aggregates, indexed by id and idempotency key
//! - **InMemoryIdempotencyStore** - see `infrastructure::idempotency_store`

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::repository::{RepositoryError, RunRepository};
use crate::domain::run::{IdempotencyKey, Run, RunId, RunStatus};

#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write();
        if let Some(existing) = runs.get(&run.id) {
            if existing.status.is_terminal() {
                return Err(RepositoryError::Storage(format!(
                    "Run {} is finalized and cannot be overwritten",
                    run.id
                )));
            }
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Result<Option<Run>, RepositoryError> {
        let runs = self.runs.read();
        Ok(runs
            .values()
            .filter(|r| r.idempotency_key.as_ref() == Some(key))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_by_actor(&self, actor: &str) -> Result<Vec<Run>, RepositoryError> {
        let runs = self.runs.read();
        let mut found: Vec<Run> = runs.values().filter(|r| r.actor == actor).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn find_by_status(&self, status: RunStatus) -> Result<Vec<Run>, RepositoryError> {
        let runs = self.runs.read();
        Ok(runs.values().filter(|r| r.status == status).cloned().collect())
    }
}
