// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Logging setup and run counters.
//!
//! Counters go through the `metrics` facade and are no-ops until the host
//! installs a recorder (e.g. a Prometheus exporter).

use anyhow::{Context, Result};

use crate::domain::config::{LogFormat, ObservabilityConfig};
use crate::domain::run::{RunStatus, StepStatus};

pub const RUNS_ADMITTED: &str = "taskpilot_runs_admitted_total";
pub const RUNS_REJECTED: &str = "taskpilot_runs_rejected_total";
pub const STEPS_EXECUTED: &str = "taskpilot_steps_executed_total";
pub const RUNS_FINALIZED: &str = "taskpilot_runs_finalized_total";

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Fails if a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .try_init(),
        LogFormat::Compact => builder.with_target(false).compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

pub fn record_admitted(actor: &str) {
    metrics::counter!(RUNS_ADMITTED, "actor" => actor.to_string()).increment(1);
}

pub fn record_rejected(reason: &'static str) {
    metrics::counter!(RUNS_REJECTED, "reason" => reason).increment(1);
}

pub fn record_step(tool_id: &str, status: StepStatus, dry_run: bool) {
    let status = match status {
        StepStatus::Success => "success",
        StepStatus::Failed => "failed",
    };
    metrics::counter!(
        STEPS_EXECUTED,
        "tool_id" => tool_id.to_string(),
        "status" => status,
        "dry_run" => if dry_run { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_finalized(status: RunStatus) {
    let status = match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    };
    metrics::counter!(RUNS_FINALIZED, "status" => status).increment(1);
}
