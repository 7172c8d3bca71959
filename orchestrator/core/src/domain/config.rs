// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) built once at
// startup and injected into the guard, the resolver and the control loop:
// - admission guard: idempotency TTL, rate window, default quota
// - actor policies: scopes, default autonomy, override capability, quotas
// - execution limits: steps, replans, run and approval timeouts
// - working memory TTL
// - risk heuristic threshold
// - logging

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::policy::{self, ActorPolicy};

pub const API_VERSION: &str = "taskpilot/v1";
pub const KIND: &str = "EngineConfig";
pub const CONFIG_PATH_ENV: &str = "TASKPILOT_CONFIG_PATH";

/// Hard ceiling on steps per run, whatever the request asks for.
pub const MAX_STEPS_LIMIT: u32 = 50;
/// Hard ceiling on the run-level timeout.
pub const MAX_RUN_TIMEOUT: Duration = Duration::from_secs(600);
pub const MAX_GOAL_CHARS: usize = 8000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// API version (must be "taskpilot/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: EngineConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigSpec {
    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default = "default_actor_policies")]
    pub actors: Vec<ActorPolicy>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// How long an idempotency key keeps pointing at its run
    #[serde(with = "humantime_serde", default = "default_idempotency_ttl")]
    pub idempotency_ttl: Duration,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length
    #[serde(with = "humantime_serde", default = "default_rate_window")]
    pub window: Duration,

    /// Requests per window for actors whose policy sets no quota
    #[serde(default = "default_quota")]
    pub default_quota: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Step ceiling applied when the request does not set one
    #[serde(default = "default_max_steps")]
    pub default_max_steps: u32,

    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Run timeout applied when the request does not set one
    #[serde(with = "humantime_serde", default = "default_run_timeout")]
    pub default_timeout: Duration,

    /// How long a pending approval waits before it fails the run
    #[serde(with = "humantime_serde", default = "default_approval_timeout")]
    pub approval_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(with = "humantime_serde", default = "default_memory_ttl")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Plans longer than this resolve to at most ExecuteNotify
    #[serde(default = "default_step_count_threshold")]
    pub step_count_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "taskpilot_core=trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

// Default value functions
fn default_idempotency_ttl() -> Duration {
    Duration::from_secs(86_400)
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_quota() -> u32 {
    60
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_replans() -> u32 {
    3
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_memory_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_step_count_threshold() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_actor_policies() -> Vec<ActorPolicy> {
    vec![
        ActorPolicy::new("admin", &["*"])
            .with_override()
            .with_rate_limit(300),
        ActorPolicy::new("n8n_workflow_*", &["notion.*", "google.*", "github.read", "local.*"]),
        ActorPolicy::new("user_*", &["local.summarize", "github.read"]),
    ]
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: default_idempotency_ttl(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            default_quota: default_quota(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_max_steps: default_max_steps(),
            max_replans: default_max_replans(),
            default_timeout: default_run_timeout(),
            approval_timeout: default_approval_timeout(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ttl: default_memory_ttl(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            step_count_threshold: default_step_count_threshold(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for EngineConfigSpec {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            actors: default_actor_policies(),
            execution: ExecutionConfig::default(),
            memory: MemoryConfig::default(),
            risk: RiskConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "taskpilot".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: EngineConfigSpec::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration, fallback to default
    /// 1. explicit path (fails if missing or invalid)
    /// 2. TASKPILOT_CONFIG_PATH environment variable
    /// 3. built-in defaults
    pub fn load_or_default(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                Self::from_yaml_file(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
                })?
            }
            None => {
                tracing::warn!("No configuration file given. Using built-in defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TASKPILOT_LOG_LEVEL") {
            tracing::info!("Environment override: TASKPILOT_LOG_LEVEL={}", level);
            self.spec.observability.level = level;
        }

        if let Ok(val) = std::env::var("TASKPILOT_LOG_FORMAT") {
            match val.to_lowercase().as_str() {
                "json" => self.spec.observability.format = LogFormat::Json,
                "compact" | "text" => self.spec.observability.format = LogFormat::Compact,
                _ => {
                    tracing::warn!(
                        "Invalid value for TASKPILOT_LOG_FORMAT: '{}'. Expected json/compact. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let guard = &self.spec.guard;
        if guard.idempotency_ttl.is_zero() {
            anyhow::bail!("spec.guard.idempotency_ttl must be positive");
        }
        if guard.rate_limit.window.is_zero() {
            anyhow::bail!("spec.guard.rate_limit.window must be positive");
        }
        if guard.rate_limit.default_quota == 0 {
            anyhow::bail!("spec.guard.rate_limit.default_quota must be positive");
        }

        for actor in &self.spec.actors {
            actor.validate()?;
            if actor.rate_limit == Some(0) {
                anyhow::bail!("Rate limit for actor pattern '{}' must be positive", actor.pattern);
            }
        }

        let execution = &self.spec.execution;
        if execution.default_max_steps == 0 || execution.default_max_steps > MAX_STEPS_LIMIT {
            anyhow::bail!(
                "spec.execution.default_max_steps must be within 1..={}",
                MAX_STEPS_LIMIT
            );
        }
        if execution.default_timeout.is_zero() || execution.default_timeout > MAX_RUN_TIMEOUT {
            anyhow::bail!(
                "spec.execution.default_timeout must be within 1s..={}s",
                MAX_RUN_TIMEOUT.as_secs()
            );
        }
        if execution.approval_timeout.is_zero() {
            anyhow::bail!("spec.execution.approval_timeout must be positive");
        }

        if self.spec.memory.ttl.is_zero() {
            anyhow::bail!("spec.memory.ttl must be positive");
        }

        Ok(())
    }

    /// The most specific actor policy, if any pattern matches.
    pub fn policy_for(&self, actor: &str) -> Option<&ActorPolicy> {
        policy::policy_for(&self.spec.actors, actor)
    }

    /// Requests per window allowed for `actor`.
    pub fn quota_for(&self, actor: &str) -> u32 {
        self.policy_for(actor)
            .and_then(|p| p.rate_limit)
            .unwrap_or(self.spec.guard.rate_limit.default_quota)
    }
}
