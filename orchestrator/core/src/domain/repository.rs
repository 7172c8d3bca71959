// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the aggregates the engine owns. Interfaces live in
//! the domain layer; implementations live in `crate::infrastructure`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `RunRepository` | `Run` | `InMemoryRunRepository` |
//! | `IdempotencyStore` | key → `RunId` | `InMemoryIdempotencyStore` |
//!
//! Durable storage engines are external collaborators; the in-memory
//! implementations back tests and single-process deployments.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::run::{IdempotencyKey, Run, RunId, RunStatus};

/// Repository interface for Run aggregates
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Save run (create or update)
    async fn save(&self, run: &Run) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError>;

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Result<Option<Run>, RepositoryError>;

    /// Runs of an actor, newest first.
    async fn find_by_actor(&self, actor: &str) -> Result<Vec<Run>, RepositoryError>;

    async fn find_by_status(&self, status: RunStatus) -> Result<Vec<Run>, RepositoryError>;
}

/// Outcome of an atomic idempotency reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key was absent (or expired) and now maps to the given run id.
    Reserved(RunId),
    /// A live reservation already exists.
    Existing(RunId),
}

/// Idempotency key → run id mapping with bounded TTL.
///
/// `reserve` is a compare-and-set: of two concurrent callers with the same
/// key exactly one gets `Reserved`, the other sees the winner's id.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<RunId>, RepositoryError>;

    async fn reserve(&self, key: &IdempotencyKey, run_id: RunId, ttl: Duration) -> Result<Reservation, RepositoryError>;

    /// Drop a reservation whose run never got created.
    async fn release(&self, key: &IdempotencyKey, run_id: RunId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
