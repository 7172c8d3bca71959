// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Admission Guard
//!
//! Admits or rejects a run request before any run exists.
//!
//! 1. idempotency lookup: a live key short-circuits to `Duplicate` without
//!    consuming quota
//! 2. sliding-window rate check against the actor's quota
//! 3. atomic reservation of the key for a fresh run id; losing a race to a
//!    concurrent request also yields `Duplicate`
//!
//! Requests without a key skip steps 1 and 3.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::error::EngineError;
use crate::domain::config::EngineConfig;
use crate::domain::repository::{IdempotencyStore, Reservation};
use crate::domain::run::{IdempotencyKey, RunId};
use crate::infrastructure::rate_limiter::SlidingWindowRateLimiter;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(RunId),
    Duplicate(RunId),
    RateLimited { retry_after: Duration },
}

pub struct AdmissionGuard {
    config: Arc<EngineConfig>,
    idempotency: Arc<dyn IdempotencyStore>,
    limiter: SlidingWindowRateLimiter,
}

impl AdmissionGuard {
    pub fn new(config: Arc<EngineConfig>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        let limiter = SlidingWindowRateLimiter::new(config.spec.guard.rate_limit.window);
        Self {
            config,
            idempotency,
            limiter,
        }
    }

    pub async fn admit(&self, key: Option<&IdempotencyKey>, actor: &str) -> Result<Admission, EngineError> {
        if let Some(key) = key {
            if let Some(existing) = self.idempotency.lookup(key).await? {
                debug!(idempotency_key = %key, run_id = %existing, "Duplicate request");
                telemetry::record_rejected("duplicate");
                return Ok(Admission::Duplicate(existing));
            }
        }

        let quota = self.config.quota_for(actor);
        if let Err(retry_after) = self.limiter.try_acquire(actor, quota) {
            warn!(
                actor = %actor,
                quota = quota,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            telemetry::record_rejected("rate_limited");
            return Ok(Admission::RateLimited { retry_after });
        }

        let run_id = RunId::new();
        if let Some(key) = key {
            let ttl = self.config.spec.guard.idempotency_ttl;
            if let Reservation::Existing(existing) = self.idempotency.reserve(key, run_id, ttl).await? {
                debug!(idempotency_key = %key, run_id = %existing, "Lost idempotency race");
                telemetry::record_rejected("duplicate");
                return Ok(Admission::Duplicate(existing));
            }
        }

        telemetry::record_admitted(actor);
        Ok(Admission::Admitted(run_id))
    }

    /// Undo the key reservation of an admitted run that could not be created.
    pub async fn release(&self, key: Option<&IdempotencyKey>, run_id: RunId) -> Result<(), EngineError> {
        if let Some(key) = key {
            self.idempotency.release(key, run_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::ActorPolicy;
    use crate::infrastructure::idempotency_store::InMemoryIdempotencyStore;

    fn guard(quota: u32) -> AdmissionGuard {
        let mut config = EngineConfig::default();
        config.spec.actors = vec![ActorPolicy::new("user_*", &["local.*"]).with_rate_limit(quota)];
        AdmissionGuard::new(Arc::new(config), Arc::new(InMemoryIdempotencyStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_does_not_consume_quota() {
        let guard = guard(1);
        let key = IdempotencyKey::new("k-1").unwrap();

        let first = match guard.admit(Some(&key), "user_1").await.unwrap() {
            Admission::Admitted(id) => id,
            other => panic!("expected admission, got {:?}", other),
        };
        assert_eq!(guard.admit(Some(&key), "user_1").await.unwrap(), Admission::Duplicate(first));
        assert!(matches!(
            guard.admit(None, "user_1").await.unwrap(),
            Admission::RateLimited { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_reports_retry_after() {
        let guard = guard(2);
        assert!(matches!(guard.admit(None, "user_1").await.unwrap(), Admission::Admitted(_)));
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(matches!(guard.admit(None, "user_1").await.unwrap(), Admission::Admitted(_)));
        assert_eq!(
            guard.admit(None, "user_1").await.unwrap(),
            Admission::RateLimited {
                retry_after: Duration::from_secs(45)
            }
        );
        assert!(matches!(guard.admit(None, "user_2").await.unwrap(), Admission::Admitted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_the_key() {
        let guard = guard(10);
        let key = IdempotencyKey::new("k-2").unwrap();
        let Admission::Admitted(run_id) = guard.admit(Some(&key), "user_1").await.unwrap() else {
            panic!("expected admission");
        };
        guard.release(Some(&key), run_id).await.unwrap();
        assert!(matches!(guard.admit(Some(&key), "user_1").await.unwrap(), Admission::Admitted(_)));
    }
}
