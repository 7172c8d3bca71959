// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod autonomy_resolver;
pub mod control_loop;
pub mod error;
pub mod executor;
pub mod guard;
pub mod reflector;
pub mod request;
pub mod run_service;

// Re-export the caller-facing surface for convenience
pub use control_loop::{CancelSignal, ControlLoop};
pub use error::EngineError;
pub use request::{RunRequest, ValidatedRequest};
pub use run_service::{EngineComponents, RunService, RunStatusView, StandardRunService};
