// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Approval Service - human-in-the-loop gates for `Ask` and `Draft` runs
//!
//! Holds pending approval requests (one per step under `Ask`, one per plan
//! under `Draft`), resolves them when a human approves or rejects, and times
//! them out. A run has at most one pending request at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use tracing::{info, warn, debug};

use crate::domain::run::{ExecutedStep, RunId};
use crate::domain::state::ApprovalScope;

/// Resolution of an approval request
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalStatus {
    Approved {
        feedback: Option<String>,
        approved_at: DateTime<Utc>,
        approved_by: Option<String>,
    },
    Rejected {
        reason: String,
        rejected_at: DateTime<Utc>,
        rejected_by: Option<String>,
    },
    TimedOut {
        timeout_at: DateTime<Utc>,
    },
    /// The run was cancelled while waiting.
    Cancelled,
}

#[derive(Debug)]
struct ApprovalRequest {
    id: Uuid,
    run_id: RunId,
    scope: ApprovalScope,
    prompt: String,
    preview: Vec<ExecutedStep>,
    created_at: DateTime<Utc>,
    timeout: Duration,
    response_tx: oneshot::Sender<ApprovalStatus>,
}

impl ApprovalRequest {
    fn info(&self) -> PendingApprovalInfo {
        PendingApprovalInfo {
            id: self.id,
            run_id: self.run_id,
            scope: self.scope,
            prompt: self.prompt.clone(),
            preview: self.preview.clone(),
            created_at: self.created_at,
            timeout_seconds: self.timeout.as_secs(),
        }
    }
}

/// Handle held by the control loop while it waits for a decision.
#[derive(Debug)]
pub struct PendingApproval {
    pub id: Uuid,
    pub scope: ApprovalScope,
    receiver: oneshot::Receiver<ApprovalStatus>,
}

impl PendingApproval {
    /// Wait for approval, rejection, timeout or cancellation.
    pub async fn wait(self) -> ApprovalStatus {
        match self.receiver.await {
            Ok(status) => status,
            // Sender dropped without a decision
            Err(_) => ApprovalStatus::Cancelled,
        }
    }
}

pub struct ApprovalService {
    /// Pending requests indexed by ID
    pending_requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl ApprovalService {
    pub fn new() -> Self {
        Self {
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a pending approval. It resolves as `TimedOut` after `timeout`
    /// unless a decision arrives first.
    pub async fn open(
        &self,
        run_id: RunId,
        scope: ApprovalScope,
        prompt: String,
        preview: Vec<ExecutedStep>,
        timeout: Duration,
    ) -> Result<PendingApproval> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        {
            let mut requests = self.pending_requests.write().await;
            if requests.values().any(|r| r.run_id == run_id) {
                anyhow::bail!("Run {} already has a pending approval", run_id);
            }
            requests.insert(
                request_id,
                ApprovalRequest {
                    id: request_id,
                    run_id,
                    scope,
                    prompt,
                    preview,
                    created_at: Utc::now(),
                    timeout,
                    response_tx: tx,
                },
            );
        }

        info!(
            request_id = %request_id,
            run_id = %run_id,
            scope = %scope,
            timeout_seconds = timeout.as_secs(),
            "Approval requested"
        );

        let pending_requests = self.pending_requests.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut requests = pending_requests.write().await;
            if let Some(request) = requests.remove(&request_id) {
                warn!(request_id = %request_id, run_id = %request.run_id, "Approval request timed out");
                let _ = request.response_tx.send(ApprovalStatus::TimedOut {
                    timeout_at: Utc::now(),
                });
            }
        });

        Ok(PendingApproval {
            id: request_id,
            scope,
            receiver: rx,
        })
    }

    /// Approve the pending request of a run
    pub async fn approve(
        &self,
        run_id: RunId,
        feedback: Option<String>,
        approved_by: Option<String>,
    ) -> Result<Uuid> {
        let request = self.take_for_run(run_id).await?;
        info!(
            request_id = %request.id,
            run_id = %run_id,
            approved_by = ?approved_by,
            "Approval granted"
        );
        let id = request.id;
        let _ = request.response_tx.send(ApprovalStatus::Approved {
            feedback,
            approved_at: Utc::now(),
            approved_by,
        });
        Ok(id)
    }

    /// Reject the pending request of a run
    pub async fn reject(
        &self,
        run_id: RunId,
        reason: String,
        rejected_by: Option<String>,
    ) -> Result<Uuid> {
        let request = self.take_for_run(run_id).await?;
        info!(
            request_id = %request.id,
            run_id = %run_id,
            rejected_by = ?rejected_by,
            reason = %reason,
            "Approval rejected"
        );
        let id = request.id;
        let _ = request.response_tx.send(ApprovalStatus::Rejected {
            reason,
            rejected_at: Utc::now(),
            rejected_by,
        });
        Ok(id)
    }

    /// Resolve a run's pending request as cancelled. No-op when none is pending.
    pub async fn cancel_for_run(&self, run_id: RunId) -> bool {
        match self.take_for_run(run_id).await {
            Ok(request) => {
                debug!(request_id = %request.id, run_id = %run_id, "Approval request cancelled");
                let _ = request.response_tx.send(ApprovalStatus::Cancelled);
                true
            }
            Err(_) => false,
        }
    }

    pub async fn list_pending(&self) -> Vec<PendingApprovalInfo> {
        let requests = self.pending_requests.read().await;
        let mut pending: Vec<_> = requests.values().map(ApprovalRequest::info).collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    pub async fn pending_for_run(&self, run_id: RunId) -> Option<PendingApprovalInfo> {
        let requests = self.pending_requests.read().await;
        requests
            .values()
            .find(|r| r.run_id == run_id)
            .map(ApprovalRequest::info)
    }

    async fn take_for_run(&self, run_id: RunId) -> Result<ApprovalRequest> {
        let mut requests = self.pending_requests.write().await;
        let id = requests
            .values()
            .find(|r| r.run_id == run_id)
            .map(|r| r.id)
            .ok_or_else(|| anyhow::anyhow!("No pending approval for run {}", run_id))?;
        requests
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("Request {} already completed", id))
    }
}

impl Default for ApprovalService {
    fn default() -> Self {
        Self::new()
    }
}

/// Information about a pending request (for serialization/API)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingApprovalInfo {
    pub id: Uuid,
    pub run_id: RunId,
    pub scope: ApprovalScope,
    pub prompt: String,
    #[serde(default)]
    pub preview: Vec<ExecutedStep>,
    pub created_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}
