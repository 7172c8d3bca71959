// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Run Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Observers (notification sinks, dashboards, tests) subscribe to every event
// or to the events of a single run. Events are lost when nobody listens.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::audit::{ApprovalRecord, AuditRecorder};
use crate::domain::events::RunEvent;
use crate::domain::repository::RepositoryError;
use crate::domain::run::{ExecutedStep, RunId, RunResult};
use crate::domain::state::Phase;

/// Event bus for publishing and subscribing to run events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RunEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RunEvent) {
        debug!(run_id = ?event.run_id(), "Publishing event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all run events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single run
    pub fn subscribe_run(&self, run_id: RunId) -> RunEventReceiver {
        RunEventReceiver {
            receiver: self.sender.subscribe(),
            run_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all run events
pub struct EventReceiver {
    receiver: broadcast::Receiver<RunEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<RunEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<RunEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one run
pub struct RunEventReceiver {
    receiver: broadcast::Receiver<RunEvent>,
    run_id: RunId,
}

impl RunEventReceiver {
    /// Receive the next event of the subscribed run
    pub async fn recv(&mut self) -> Result<RunEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.run_id() == Some(self.run_id) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// The bus doubles as a live audit sink for observers.
#[async_trait]
impl AuditRecorder for EventBus {
    async fn record_step(&self, run_id: RunId, step: &ExecutedStep) -> Result<(), RepositoryError> {
        self.publish(RunEvent::StepRecorded {
            run_id,
            step: step.clone(),
        });
        Ok(())
    }

    async fn record_transition(&self, run_id: RunId, from: Phase, to: Phase) -> Result<(), RepositoryError> {
        self.publish(RunEvent::PhaseChanged {
            run_id,
            from,
            to,
            changed_at: Utc::now(),
        });
        Ok(())
    }

    async fn record_approval(&self, run_id: RunId, approval: &ApprovalRecord) -> Result<(), RepositoryError> {
        self.publish(RunEvent::ApprovalRecorded {
            run_id,
            approval: approval.clone(),
        });
        Ok(())
    }

    async fn finalize(&self, run_id: RunId, result: &RunResult) -> Result<(), RepositoryError> {
        self.publish(RunEvent::RunFinalized {
            run_id,
            status: result.status,
            result: Box::new(result.clone()),
        });
        Ok(())
    }
}
