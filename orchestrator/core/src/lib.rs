// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Taskpilot core
//!
//! Autonomous task-execution engine: a goal is planned into tool steps,
//! executed under an autonomy policy, reflected on, and replanned until it
//! completes or fails.
//!
//! # Architecture
//!
//! - **domain:** run aggregate, loop state, plans, tool contract, ports
//! - **application:** admission guard, autonomy resolver, executor,
//!   reflector, control loop, run service
//! - **infrastructure:** in-memory stores, approval service, event bus,
//!   audit recorders, tool registry, telemetry

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
