// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Sliding-window rate limiter keyed by actor.
//!
//! Each actor keeps a log of admission instants inside the window. The check
//! and the insert happen under the actor's `DashMap` entry lock, so concurrent
//! requests from one actor cannot both take the last slot.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    window: Duration,
    log: Arc<DashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            log: Arc::new(DashMap::new()),
        }
    }

    /// Take one slot for `actor` if fewer than `quota` admissions happened in
    /// the current window. On refusal returns how long until the oldest
    /// admission leaves the window.
    pub fn try_acquire(&self, actor: &str, quota: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entry = self.log.entry(actor.to_string()).or_default();
        let hits = entry.value_mut();

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= quota as usize {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_quota_and_retry_after() {
        let limiter = SlidingWindowRateLimiter::new(Duration::from_secs(60));

        assert!(limiter.try_acquire("user_1", 2).is_ok());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire("user_1", 2).is_ok());

        let retry_after = limiter.try_acquire("user_1", 2).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(50));

        // Other actors have their own window
        assert!(limiter.try_acquire("user_2", 2).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = SlidingWindowRateLimiter::new(Duration::from_secs(60));
        assert!(limiter.try_acquire("admin", 1).is_ok());
        assert!(limiter.try_acquire("admin", 1).is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire("admin", 1).is_ok());
    }
}
