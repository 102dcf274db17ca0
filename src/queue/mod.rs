// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable offline operation queue.
//!
//! Mutations made while offline are queued, persisted, and replayed against
//! the API once the network is back:
//!
//! ```text
//!  enqueue ──► memory + KvStore ("queue:op:<id>")
//!                  │
//!          (Online, worker triggered)
//!                  ▼
//!  drain: ready ops by priority, FIFO ──► OperationHandler
//!     ok        ──► removed
//!     retryable ──► retry_count += 1, next_attempt_at = now + backoff
//!     terminal  ──► removed, optimistic update rolled back,
//!                   FailedOperation ("queue:failed:<id>"), Sync error reported
//! ```
//!
//! The in-memory copy is authoritative. Store failures are logged and
//! counted, never surfaced to the caller; `persist_all` re-mirrors
//! everything at shutdown.

pub mod handler;
pub mod operation;
pub mod options;
pub mod types;

pub use handler::{FnHandler, HandlerError, HandlerRegistry, OperationHandler};
pub use operation::{OperationType, OptimisticUpdate, Priority, QueuedOperation, UpdateFn};
pub use options::EnqueueOptions;
pub use types::{DrainReport, FailedOperation, QueueError, QueueSnapshot, SyncStatus};

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::config::OfflineSyncConfig;
use crate::network::NetworkStatus;
use crate::recovery::{ErrorContext, ErrorRecoveryManager, ErrorType};
use crate::resilience::retry::RetryConfig;
use crate::storage::{KvStore, StorageError};

const OP_PREFIX: &str = "queue:op:";
const FAILED_PREFIX: &str = "queue:failed:";

fn op_key(id: &str) -> String {
    format!("{}{}", OP_PREFIX, id)
}

fn failed_key(id: &str) -> String {
    format!("{}{}", FAILED_PREFIX, id)
}

/// Drain tuning.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub default_max_retries: u32,
    pub retry: RetryConfig,
    pub inter_operation_delay: Duration,
    pub redrain_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&OfflineSyncConfig::default())
    }
}

impl From<&OfflineSyncConfig> for QueueSettings {
    fn from(config: &OfflineSyncConfig) -> Self {
        Self {
            batch_size: config.queue_batch_size.max(1),
            default_max_retries: config.default_max_retries,
            retry: config.retry_config(),
            inter_operation_delay: Duration::from_millis(config.inter_operation_delay_ms),
            redrain_delay: Duration::from_millis(config.redrain_delay_ms),
        }
    }
}

#[derive(Default)]
struct QueueState {
    operations: HashMap<String, QueuedOperation>,
    failed: Vec<FailedOperation>,
    status: SyncStatus,
    last_sync: Option<i64>,
    last_error: Option<String>,
}

/// RAII guard to reset the draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Settled {
    Succeeded,
    Retried,
    Failed,
}

pub struct OfflineQueue {
    state: RwLock<QueueState>,
    store: Arc<dyn KvStore>,
    handlers: HandlerRegistry,
    settings: QueueSettings,
    clock: SharedClock,
    network: watch::Receiver<NetworkStatus>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    trigger: Notify,
    draining: AtomicBool,
    /// Next enqueue sequence number
    next_seq: AtomicU64,
    cache: Option<Arc<TieredCache>>,
    recovery: Option<ErrorRecoveryManager>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn KvStore>,
        handlers: HandlerRegistry,
        settings: QueueSettings,
        clock: SharedClock,
        network: watch::Receiver<NetworkStatus>,
    ) -> Self {
        let initial = QueueSnapshot {
            status: SyncStatus::Idle,
            network_status: *network.borrow(),
            queue_size: 0,
            last_sync: None,
            failed_count: 0,
            last_error: None,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            state: RwLock::new(QueueState::default()),
            store,
            handlers,
            settings,
            clock,
            network,
            snapshot_tx,
            trigger: Notify::new(),
            draining: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            cache: None,
            recovery: None,
        }
    }

    /// Cache that optimistic updates are applied to and rolled back in.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Where terminal failures, handler panics and storage quota failures
    /// are reported.
    #[must_use]
    pub fn with_recovery(mut self, recovery: ErrorRecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a mutation. Returns the operation id.
    ///
    /// The optimistic update (if any) is applied to the cache first. If the
    /// network is online the sync worker is woken immediately.
    pub async fn enqueue(&self, op_type: OperationType, payload: Value, options: EnqueueOptions) -> String {
        let mut op = QueuedOperation::new(op_type, payload, self.clock.now_ms())
            .with_seq(self.next_seq.fetch_add(1, Ordering::Relaxed))
            .with_priority(options.priority)
            .with_max_retries(options.max_retries.unwrap_or(self.settings.default_max_retries));

        if let Some(update) = options.optimistic {
            self.apply_optimistic(&update).await;
            op.optimistic_update = Some(update);
        }

        let id = op.id.clone();
        self.persist_op(&op).await;
        {
            let mut state = self.state.write();
            state.operations.insert(id.clone(), op);
        }

        info!(id = %id, op_type = %op_type, priority = ?options.priority, "Operation queued");
        crate::metrics::record_operation(op_type.as_str(), "queued");
        self.publish();

        if self.is_online() && self.status() == SyncStatus::Idle {
            self.trigger();
        }
        id
    }

    /// Wake the sync worker.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Leave `Paused`/`Error` and drain.
    pub fn start_sync(&self) {
        let changed = {
            let mut state = self.state.write();
            match state.status {
                SyncStatus::Paused | SyncStatus::Error => {
                    state.status = SyncStatus::Idle;
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!("Sync resumed");
            crate::metrics::set_queue_state("Idle");
            self.publish();
        }
        self.trigger();
    }

    /// Stop draining until `start_sync`. A batch in progress stops after
    /// its current operation.
    pub fn stop_sync(&self) {
        self.set_status(SyncStatus::Paused);
        info!("Sync paused");
    }

    /// Drop every pending operation, rolling back their optimistic updates.
    pub async fn clear_queue(&self) -> usize {
        let ops: Vec<QueuedOperation> = {
            let mut state = self.state.write();
            state.operations.drain().map(|(_, op)| op).collect()
        };

        for op in &ops {
            self.rollback(op).await;
            self.unpersist(&op_key(&op.id)).await;
        }

        info!(cleared = ops.len(), "Operation queue cleared");
        self.publish();
        ops.len()
    }

    /// Re-queue every failed operation with a fresh retry budget.
    pub async fn retry_failed_operations(&self) -> usize {
        let now = self.clock.now_ms();
        let failed: Vec<FailedOperation> = {
            let mut state = self.state.write();
            if state.status == SyncStatus::Error {
                state.status = SyncStatus::Idle;
            }
            std::mem::take(&mut state.failed)
        };

        for entry in &failed {
            let mut op = entry.operation.clone();
            op.retry_count = 0;
            op.next_attempt_at = now;
            op.last_error = None;

            self.persist_op(&op).await;
            self.unpersist(&failed_key(&op.id)).await;
            self.state.write().operations.insert(op.id.clone(), op);
        }

        info!(requeued = failed.len(), "Failed operations re-queued");
        self.publish();
        self.trigger();
        failed.len()
    }

    /// Forget failed operations.
    pub async fn clear_failed(&self) -> usize {
        let failed = std::mem::take(&mut self.state.write().failed);
        for entry in &failed {
            self.unpersist(&failed_key(&entry.operation.id)).await;
        }
        self.publish();
        failed.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════

    /// Reload operations and failures from the store.
    ///
    /// Operations already in memory win over their stored copy. Unreadable
    /// records are logged and deleted.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let mut restored = 0;

        for key in self.store.keys_with_prefix(OP_PREFIX).await? {
            match self.load::<QueuedOperation>(&key).await {
                Some(op) => {
                    // New enqueues must sort after everything restored
                    self.next_seq.fetch_max(op.seq.saturating_add(1), Ordering::Relaxed);
                    let mut state = self.state.write();
                    if !state.operations.contains_key(&op.id) {
                        state.operations.insert(op.id.clone(), op);
                        restored += 1;
                    }
                }
                None => self.unpersist(&key).await,
            }
        }

        let mut failed = Vec::new();
        for key in self.store.keys_with_prefix(FAILED_PREFIX).await? {
            match self.load::<FailedOperation>(&key).await {
                Some(entry) => failed.push(entry),
                None => self.unpersist(&key).await,
            }
        }
        {
            let mut state = self.state.write();
            for entry in failed {
                if !state.failed.iter().any(|f| f.operation.id == entry.operation.id) {
                    state.failed.push(entry);
                }
            }
            state.failed.sort_by_key(|f| f.failed_at);
        }

        info!(restored, pending = self.len(), failed = self.failed_count(), "Operation queue restored");
        self.publish();
        Ok(restored)
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.read(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(key, error = %e, "Dropping unreadable queue record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read queue record");
                None
            }
        }
    }

    /// Write every pending and failed operation back to the store.
    pub async fn persist_all(&self) -> Result<(), QueueError> {
        let (ops, failed) = {
            let state = self.state.read();
            (
                state.operations.values().cloned().collect::<Vec<_>>(),
                state.failed.clone(),
            )
        };

        let mut last_error = None;
        for op in &ops {
            let value = serde_json::to_value(op)?;
            if let Err(e) = self.store.write(&op_key(&op.id), &value).await {
                warn!(id = %op.id, error = %e, "Failed to persist operation");
                last_error = Some(e);
            }
        }
        for entry in &failed {
            let value = serde_json::to_value(entry)?;
            if let Err(e) = self.store.write(&failed_key(&entry.operation.id), &value).await {
                warn!(id = %entry.operation.id, error = %e, "Failed to persist failed operation");
                last_error = Some(e);
            }
        }

        debug!(pending = ops.len(), failed = failed.len(), "Queue persisted");
        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn persist_op(&self, op: &QueuedOperation) {
        let value = match serde_json::to_value(op) {
            Ok(value) => value,
            Err(e) => {
                error!(id = %op.id, error = %e, "Cannot serialize operation");
                crate::metrics::record_persist_error("serialize");
                return;
            }
        };
        if let Err(e) = self.store.write(&op_key(&op.id), &value).await {
            warn!(id = %op.id, error = %e, "Failed to persist operation, keeping in memory");
            crate::metrics::record_persist_error("write");
            self.report_storage(&e, &op.id);
        }
    }

    async fn persist_failed(&self, entry: &FailedOperation) {
        let value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                error!(id = %entry.operation.id, error = %e, "Cannot serialize failed operation");
                crate::metrics::record_persist_error("serialize");
                return;
            }
        };
        if let Err(e) = self.store.write(&failed_key(&entry.operation.id), &value).await {
            warn!(id = %entry.operation.id, error = %e, "Failed to persist failed operation");
            crate::metrics::record_persist_error("write");
            self.report_storage(&e, &entry.operation.id);
        }
    }

    /// Quota failures go to the recovery manager; other store errors are
    /// only logged since the in-memory copy is authoritative.
    fn report_storage(&self, err: &StorageError, id: &str) {
        if !err.is_capacity() {
            return;
        }
        if let Some(recovery) = &self.recovery {
            recovery.report(
                ErrorType::Storage,
                format!("Queue store '{}': {}", self.store.name(), err),
                ErrorContext::new("queue")
                    .with_action("persist")
                    .with_detail("operation_id", id)
                    .with_detail("tier", self.store.name()),
            );
        }
    }

    async fn unpersist(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key, error = %e, "Failed to delete queue record");
            crate::metrics::record_persist_error("delete");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drain
    // ═══════════════════════════════════════════════════════════════════════

    /// Process one batch of ready operations.
    ///
    /// Skipped (empty report) when paused, in error, not online, or when
    /// another drain is already running.
    pub async fn drain(&self) -> DrainReport {
        if matches!(self.status(), SyncStatus::Paused | SyncStatus::Error) || !self.is_online() {
            return DrainReport::skipped(self.len());
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Drain already running");
            return DrainReport::skipped(self.len());
        }
        let _guard = DrainGuard(&self.draining);

        let started = Instant::now();
        let now = self.clock.now_ms();
        let batch: Vec<QueuedOperation> = {
            let mut state = self.state.write();
            // Re-check under the lock; stop_sync may have raced us
            if state.status != SyncStatus::Idle {
                return DrainReport::skipped(state.operations.len());
            }
            let mut ready: Vec<&QueuedOperation> =
                state.operations.values().filter(|op| op.is_ready(now)).collect();
            ready.sort_by(|a, b| QueuedOperation::drain_order(a, b));
            let batch: Vec<QueuedOperation> =
                ready.into_iter().take(self.settings.batch_size).cloned().collect();
            if !batch.is_empty() {
                state.status = SyncStatus::Syncing;
            }
            batch
        };

        let mut report = DrainReport::default();
        if batch.is_empty() {
            report.remaining = self.len();
            report.next_drain_in = self.next_drain_in(now);
            return report;
        }

        crate::metrics::set_queue_state("Syncing");
        self.publish();
        info!(batch = batch.len(), pending = self.len(), "Draining operation queue");

        for (i, op) in batch.into_iter().enumerate() {
            if self.status() != SyncStatus::Syncing || !self.is_online() {
                debug!("Drain interrupted");
                break;
            }
            // Cleared or settled elsewhere since the batch was taken
            if !self.state.read().operations.contains_key(&op.id) {
                continue;
            }
            if i > 0 && !self.settings.inter_operation_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_operation_delay).await;
            }

            let applied = AssertUnwindSafe(self.apply_one(&op)).catch_unwind().await;
            let result = match applied {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(&*panic);
                    self.enter_error(&op, &message);
                    report.processed += 1;
                    report.remaining = self.len();
                    crate::metrics::record_drain(report.processed, started.elapsed());
                    return report;
                }
            };

            report.processed += 1;
            match self.settle(op, result).await {
                Settled::Succeeded => report.succeeded += 1,
                Settled::Retried => report.retried += 1,
                Settled::Failed => report.failed += 1,
            }
        }

        let now = self.clock.now_ms();
        {
            let mut state = self.state.write();
            if report.succeeded > 0 {
                state.last_sync = Some(now);
            }
            if state.status == SyncStatus::Syncing {
                state.status = SyncStatus::Idle;
            }
        }
        crate::metrics::set_queue_state(&self.status().to_string());

        report.remaining = self.len();
        report.next_drain_in = self.next_drain_in(now);
        crate::metrics::record_drain(report.processed, started.elapsed());
        self.publish();

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            remaining = report.remaining,
            "Drain batch complete"
        );
        report
    }

    async fn apply_one(&self, op: &QueuedOperation) -> Result<Value, HandlerError> {
        let Some(handler) = self.handlers.get(op.op_type) else {
            return Err(HandlerError::permanent(format!(
                "No handler registered for {}",
                op.op_type
            )));
        };

        let started = Instant::now();
        let result = handler.apply(op).await;
        crate::metrics::record_operation_latency(op.op_type.as_str(), started.elapsed());
        result
    }

    async fn settle(&self, mut op: QueuedOperation, result: Result<Value, HandlerError>) -> Settled {
        let err = match result {
            Ok(_) => {
                self.state.write().operations.remove(&op.id);
                self.unpersist(&op_key(&op.id)).await;
                debug!(id = %op.id, op_type = %op.op_type, "Operation applied");
                crate::metrics::record_operation(op.op_type.as_str(), "success");
                return Settled::Succeeded;
            }
            Err(err) => err,
        };

        // Never past the budget, even when the budget is zero
        let attempts = op.retry_count + 1;
        op.retry_count = attempts.min(op.max_retries);
        op.last_error = Some(err.message.clone());

        if err.retryable && attempts < op.max_retries {
            let delay = self.settings.retry.random_delay(op.retry_count);
            op.next_attempt_at = self.clock.now_ms() + delay.as_millis() as i64;
            warn!(
                id = %op.id,
                op_type = %op.op_type,
                attempt = op.retry_count,
                max = op.max_retries,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, will retry"
            );

            let still_queued = {
                let mut state = self.state.write();
                match state.operations.get_mut(&op.id) {
                    Some(slot) => {
                        slot.retry_count = op.retry_count;
                        slot.next_attempt_at = op.next_attempt_at;
                        slot.last_error = op.last_error.clone();
                        true
                    }
                    None => false,
                }
            };
            if still_queued {
                self.persist_op(&op).await;
            }
            crate::metrics::record_operation(op.op_type.as_str(), "retry");
            return Settled::Retried;
        }

        error!(
            id = %op.id,
            op_type = %op.op_type,
            attempts,
            error = %err,
            "Operation failed permanently"
        );
        crate::metrics::record_operation(op.op_type.as_str(), "failed");

        self.state.write().operations.remove(&op.id);
        self.unpersist(&op_key(&op.id)).await;
        self.rollback(&op).await;

        let error_id = self.recovery.as_ref().map(|recovery| {
            recovery.report(
                ErrorType::Sync,
                format!("{} failed after {} attempt(s): {}", op.op_type, attempts, err),
                ErrorContext::new("queue")
                    .with_action(op.op_type.as_str())
                    .with_detail("operation_id", op.id.clone()),
            )
        });

        // Rollback is done; don't carry it into the retry path
        op.optimistic_update = None;
        let entry = FailedOperation {
            operation: op,
            error: err.message,
            failed_at: self.clock.now_ms(),
            error_id,
        };
        self.persist_failed(&entry).await;
        {
            let mut state = self.state.write();
            state.last_error = Some(entry.error.clone());
            state.failed.push(entry);
        }
        Settled::Failed
    }

    fn enter_error(&self, op: &QueuedOperation, message: &str) {
        error!(id = %op.id, op_type = %op.op_type, panic = message, "Operation handler panicked, sync halted");
        {
            let mut state = self.state.write();
            state.status = SyncStatus::Error;
            state.last_error = Some(format!("{} handler panicked: {}", op.op_type, message));
        }
        crate::metrics::set_queue_state("Error");
        crate::metrics::record_operation(op.op_type.as_str(), "panic");

        if let Some(recovery) = &self.recovery {
            recovery.report(
                ErrorType::Sync,
                format!("{} handler panicked: {}", op.op_type, message),
                ErrorContext::new("queue")
                    .with_action(op.op_type.as_str())
                    .with_detail("operation_id", op.id.clone()),
            );
        }
        self.publish();
    }

    /// Sync worker: drains whenever triggered, and again when the last
    /// report asks for it. Exits on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut next: Option<Duration> = None;
        info!("Sync worker started");

        loop {
            let wait = next.unwrap_or(Duration::from_secs(24 * 60 * 60));
            tokio::select! {
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(wait), if next.is_some() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.drain().await;
            next = report.next_drain_in;
        }
        info!("Sync worker stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Optimistic updates
    // ═══════════════════════════════════════════════════════════════════════

    async fn apply_optimistic(&self, update: &OptimisticUpdate) {
        let Some(cache) = &self.cache else {
            warn!(key = %update.cache_key, "Optimistic update without a cache, ignored");
            return;
        };
        let current = cache.peek(&update.cache_key).await;
        self.write_cache(cache, &update.cache_key, update.apply(current.as_ref()), update.ttl)
            .await;
    }

    async fn rollback(&self, op: &QueuedOperation) {
        let (Some(update), Some(cache)) = (&op.optimistic_update, &self.cache) else {
            return;
        };
        let current = cache.peek(&update.cache_key).await;
        self.write_cache(cache, &update.cache_key, update.rollback(current.as_ref()), update.ttl)
            .await;
        debug!(id = %op.id, key = %update.cache_key, "Optimistic update rolled back");
    }

    async fn write_cache(&self, cache: &TieredCache, key: &str, value: Option<Value>, ttl: Option<Duration>) {
        let result = match value {
            Some(value) => cache.set(key, value, ttl).await,
            None => cache.delete(key).await,
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Optimistic cache write failed");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    fn is_online(&self) -> bool {
        *self.network.borrow() == NetworkStatus::Online
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.status, status) != status
        };
        if changed {
            crate::metrics::set_queue_state(&status.to_string());
            self.publish();
        }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.state.read().status
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.state.read().failed.len()
    }

    /// Pending operations in drain order.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        let mut ops: Vec<QueuedOperation> = self.state.read().operations.values().cloned().collect();
        ops.sort_by(QueuedOperation::drain_order);
        ops
    }

    #[must_use]
    pub fn failed_operations(&self) -> Vec<FailedOperation> {
        self.state.read().failed.clone()
    }

    /// Time until the earliest backed-off operation becomes ready.
    #[must_use]
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        self.state
            .read()
            .operations
            .values()
            .map(|op| op.next_attempt_at)
            .min()
            .map(|at| Duration::from_millis((at - now).max(0) as u64))
    }

    fn next_drain_in(&self, now: i64) -> Option<Duration> {
        let any_ready = self.state.read().operations.values().any(|op| op.is_ready(now));
        if any_ready && self.is_online() {
            return Some(self.settings.redrain_delay);
        }
        self.next_ready_in()
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.read();
        QueueSnapshot {
            status: state.status,
            network_status: *self.network.borrow(),
            queue_size: state.operations.len(),
            last_sync: state.last_sync,
            failed_count: state.failed.len(),
            last_error: state.last_error.clone(),
        }
    }

    /// Snapshot stream; a new value is published only when it changed.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Recompute and publish the snapshot (e.g. after a network change).
    pub fn publish(&self) {
        let snapshot = self.snapshot();
        crate::metrics::set_queue_size(snapshot.queue_size);
        crate::metrics::set_failed_operations(snapshot.failed_count);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
