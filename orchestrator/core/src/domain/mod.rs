// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: entities, value objects and the ports the engine depends on.

pub mod audit;
pub mod autonomy;
pub mod config;
pub mod events;
pub mod memory;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod reflection;
pub mod repository;
pub mod run;
pub mod state;
pub mod template;
pub mod tool;
