// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-flight request deduplication.
//!
//! At most one fetch runs per key. Callers arriving while it is pending
//! await the same shared future and receive a clone of its result, `Ok` or
//! `Err`. The entry is removed once the future settles, so the next call
//! after that starts a fresh fetch.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Pending<T, E> {
    future: SharedResult<T, E>,
    started_at: Instant,
    /// Distinguishes this fetch from a later one under the same key
    generation: u64,
}

pub struct RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pending: DashMap<String, Pending<T, E>>,
    generation: AtomicU64,
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `f` for `key`, or join the fetch already running for it.
    ///
    /// `f` is only called by the caller that starts the fetch, and must not
    /// call back into this deduplicator for the same key.
    pub async fn execute<F, Fut>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (future, generation) = match self.pending.entry(key.to_string()) {
            // A settled entry whose owner never cleaned up (caller dropped)
            Entry::Occupied(mut occupied) if occupied.get().future.peek().is_some() => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let future = f().boxed().shared();
                occupied.insert(Pending {
                    future: future.clone(),
                    started_at: Instant::now(),
                    generation,
                });
                crate::metrics::record_dedup("leader");
                (future, generation)
            }
            Entry::Occupied(occupied) => {
                trace!(key, "Joining in-flight request");
                crate::metrics::record_dedup("joined");
                (occupied.get().future.clone(), occupied.get().generation)
            }
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let future = f().boxed().shared();
                vacant.insert(Pending {
                    future: future.clone(),
                    started_at: Instant::now(),
                    generation,
                });
                crate::metrics::record_dedup("leader");
                (future, generation)
            }
        };
        crate::metrics::set_in_flight_requests(self.pending.len());

        let result = future.await;

        // Every awaiter tries; only the first removes, and only its own fetch
        self.pending.remove_if(key, |_, p| p.generation == generation);
        crate::metrics::set_in_flight_requests(self.pending.len());
        result
    }

    /// Number of keys with an unsettled fetch.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| p.value().future.peek().is_none())
            .count()
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .get(key)
            .is_some_and(|p| p.value().future.peek().is_none())
    }

    /// How long the fetch for `key` has been running.
    #[must_use]
    pub fn pending_for(&self, key: &str) -> Option<Duration> {
        self.pending.get(key).map(|p| p.value().started_at.elapsed())
    }
}

impl<T, E> Default for RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
