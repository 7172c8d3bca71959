// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod approval_service;
pub mod audit_log;
pub mod event_bus;
pub mod idempotency_store;
pub mod memory_store;
pub mod rate_limiter;
pub mod repositories;
pub mod telemetry;
pub mod tool_registry;

pub use approval_service::{ApprovalService, ApprovalStatus, PendingApprovalInfo};
