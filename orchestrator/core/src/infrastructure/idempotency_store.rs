// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory idempotency store.
//!
//! Reservations are compare-and-set on a `DashMap` entry, so two concurrent
//! requests with the same key serialize on the shard lock and exactly one of
//! them wins. Expired reservations are treated as absent and replaced in the
//! same critical section; every `SWEEP_EVERY` reservations the whole map is
//! swept so keys that are never reused do not pile up.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::repository::{IdempotencyStore, RepositoryError, Reservation};
use crate::domain::run::{IdempotencyKey, RunId};

const SWEEP_EVERY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Slot {
    run_id: RunId,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    slots: Arc<DashMap<String, Slot>>,
    reservations: Arc<AtomicUsize>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired reservations. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before - self.slots.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<RunId>, RepositoryError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key.as_str())
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.run_id))
    }

    async fn reserve(&self, key: &IdempotencyKey, run_id: RunId, ttl: Duration) -> Result<Reservation, RepositoryError> {
        // Sweep before taking the entry lock; `retain` visits every shard.
        if self.reservations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "Swept expired idempotency reservations");
            }
        }

        let now = Instant::now();
        let fresh = Slot {
            run_id,
            expires_at: now + ttl,
        };
        match self.slots.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(Reservation::Existing(occupied.get().run_id));
                }
                debug!(idempotency_key = %key, "Replacing expired idempotency reservation");
                occupied.insert(fresh);
                Ok(Reservation::Reserved(run_id))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(Reservation::Reserved(run_id))
            }
        }
    }

    async fn release(&self, key: &IdempotencyKey, run_id: RunId) -> Result<(), RepositoryError> {
        self.slots
            .remove_if(key.as_str(), |_, slot| slot.run_id == run_id);
        Ok(())
    }
}
