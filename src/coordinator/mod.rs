// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline sync coordinator.
//!
//! [`OfflineSync`] ties the components together:
//! - tiered cache (memory, local file, SQLite)
//! - request deduplicator in front of cache misses
//! - durable operation queue replayed through the API handlers
//! - network monitor driving the queue
//! - error recovery manager with actions wired back into queue and cache
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{EngineState, HandlerRegistry, OfflineSync, OfflineSyncConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = OfflineSyncConfig {
//!     durable_store_path: Some("./offline.db".into()),
//!     ..Default::default()
//! };
//! let sync = OfflineSync::open(config, HandlerRegistry::new(), None).await;
//! assert_eq!(sync.state(), EngineState::Created);
//!
//! sync.start().await.expect("start failed");
//! // ...
//! sync.shutdown().await;
//! # }
//! ```

mod actions;
mod lifecycle;
mod types;

pub use types::{EngineError, EngineState, FetchError};

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheMetrics, CacheTier, TieredCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::OfflineSyncConfig;
use crate::dedup::RequestDeduplicator;
use crate::network::{ConnectivityProbe, HttpProbe, NetworkMonitor, NetworkStatus};
use crate::queue::{
    EnqueueOptions, FailedOperation, HandlerRegistry, OfflineQueue, OperationType, QueueSettings, QueueSnapshot,
};
use crate::recovery::{AppError, ErrorContext, ErrorRecoveryManager, ErrorStats, RecoverySettings};
use crate::storage::{FileStore, InMemoryStore, KvStore, SqlStore};

use actions::{ComponentRecovery, MEMORY_TIER};

/// The offline-first data layer for one client session.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct OfflineSync {
    pub(super) config: OfflineSyncConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) cache: Arc<TieredCache>,
    pub(super) dedup: RequestDeduplicator<Value, FetchError>,
    pub(super) queue: Arc<OfflineQueue>,
    pub(super) monitor: Arc<NetworkMonitor>,
    pub(super) recovery: ErrorRecoveryManager,

    /// Stops every background task
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Kept to close the pool on shutdown
    pub(super) durable: Option<Arc<SqlStore>>,
}

impl OfflineSync {
    /// Build the default composition from `config`.
    ///
    /// The memory tier is always present. The local file tier and the
    /// SQLite tier are added when their paths are configured; one that
    /// fails to open is skipped with a warning. The queue persists to the
    /// slowest tier that opened.
    ///
    /// Without an explicit `probe`, `config.probe_url` (if any) is probed
    /// over HTTP.
    pub async fn open(
        config: OfflineSyncConfig,
        handlers: HandlerRegistry,
        probe: Option<Arc<dyn ConnectivityProbe>>,
    ) -> Self {
        let clock = system_clock();

        let memory: Arc<dyn KvStore> = Arc::new(InMemoryStore::named(
            MEMORY_TIER,
            Some(config.memory_tier_max_bytes),
        ));
        let mut tiers = vec![CacheTier::new(MEMORY_TIER, 0, memory.clone())];
        let mut queue_store = memory;

        if let Some(path) = &config.local_store_path {
            match FileStore::open(path, Some(config.local_tier_max_bytes)).await {
                Ok(store) => {
                    let store: Arc<dyn KvStore> = Arc::new(store);
                    tiers.push(CacheTier::new("local", 1, store.clone()));
                    queue_store = store;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Local tier unavailable");
                    crate::metrics::set_tier_available("local", false);
                }
            }
        }

        let mut durable = None;
        if let Some(path) = &config.durable_store_path {
            match SqlStore::open_sqlite(path, Some(config.durable_tier_max_bytes)).await {
                Ok(store) => {
                    let store = Arc::new(store);
                    tiers.push(CacheTier::new("durable", 2, store.clone()));
                    queue_store = store.clone();
                    durable = Some(store);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Durable tier unavailable, queue will not survive restarts");
                    crate::metrics::set_tier_available("durable", false);
                }
            }
        }

        let probe = probe.or_else(|| {
            let url = config.probe_url.as_deref()?;
            match HttpProbe::new(url, config.probe_timeout()) {
                Ok(probe) => Some(Arc::new(probe) as Arc<dyn ConnectivityProbe>),
                Err(e) => {
                    warn!(url, error = %e, "Connectivity probe disabled");
                    None
                }
            }
        });
        let monitor = Arc::new(NetworkMonitor::new(
            probe,
            Duration::from_millis(config.probe_interval_ms),
            config.probe_timeout(),
        ));

        let cache = Arc::new(TieredCache::new(
            tiers,
            config.write_policy,
            config.default_ttl(),
            clock.clone(),
        ));

        let mut sync = Self::from_parts(config, cache, queue_store, handlers, monitor, clock);
        sync.durable = durable;
        sync
    }

    /// Compose from prebuilt parts.
    pub fn from_parts(
        config: OfflineSyncConfig,
        cache: Arc<TieredCache>,
        queue_store: Arc<dyn KvStore>,
        handlers: HandlerRegistry,
        monitor: Arc<NetworkMonitor>,
        clock: SharedClock,
    ) -> Self {
        let recovery = ErrorRecoveryManager::new(RecoverySettings::from(&config), clock.clone());
        let queue = Arc::new(
            OfflineQueue::new(
                queue_store,
                handlers,
                QueueSettings::from(&config),
                clock,
                monitor.subscribe(),
            )
            .with_cache(cache.clone())
            .with_recovery(recovery.clone()),
        );
        cache.set_recovery(recovery.clone());
        recovery.set_handler(Arc::new(ComponentRecovery {
            queue: Arc::downgrade(&queue),
            cache: Arc::downgrade(&cache),
            monitor: Arc::downgrade(&monitor),
        }));

        let (state, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            state,
            state_rx,
            cache,
            dedup: RequestDeduplicator::new(),
            queue,
            monitor,
            recovery,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            durable: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn config(&self) -> &OfflineSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Cached read with a deduplicated fallback to `source`.
    ///
    /// Concurrent calls for the same key share one cache lookup and at most
    /// one `source` call. A fetched value is written to the cache with
    /// `ttl` (default TTL if `None`); a failed fetch is not cached and is
    /// recorded with the recovery manager.
    pub async fn fetch<F, Fut>(&self, key: &str, ttl: Option<Duration>, source: F) -> Result<Value, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let recovery = self.recovery.clone();
        let key_owned = key.to_string();

        self.dedup
            .execute(key, move || async move {
                if let Some(value) = cache.get(&key_owned).await {
                    return Ok(value);
                }

                let value = match source().await {
                    Ok(value) => value,
                    Err(e) => {
                        recovery.handle_error(
                            &e,
                            ErrorContext::default()
                                .with_action("fetch")
                                .with_detail("key", key_owned.clone()),
                        );
                        return Err(e);
                    }
                };

                if let Err(e) = cache.set(&key_owned, value.clone(), ttl).await {
                    warn!(key = %key_owned, error = %e, "Fetched value not cached");
                }
                debug!(key = %key_owned, "Fetched from source");
                Ok(value)
            })
            .await
    }

    /// Pre-load `keys` through [`fetch`](Self::fetch). Keys already cached
    /// are skipped. Returns how many were fetched; failures are logged.
    pub async fn warm<F, Fut>(&self, keys: &[&str], ttl: Option<Duration>, source: F) -> usize
    where
        F: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let mut warmed = 0;
        for key in keys {
            if self.cache.exists(key).await {
                continue;
            }
            let source = source.clone();
            let owned = key.to_string();
            match self.fetch(key, ttl, move || source(owned)).await {
                Ok(_) => warmed += 1,
                Err(e) => warn!(key = %key, error = %e, "Cache warm-up fetch failed"),
            }
        }
        debug!(requested = keys.len(), warmed, "Cache warm-up complete");
        warmed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a mutation for replay. Returns the operation id.
    pub async fn enqueue(&self, op_type: OperationType, payload: Value, options: EnqueueOptions) -> String {
        self.queue.enqueue(op_type, payload, options).await
    }

    pub fn start_sync(&self) {
        self.queue.start_sync();
    }

    pub fn stop_sync(&self) {
        self.queue.stop_sync();
    }

    pub async fn clear_queue(&self) -> usize {
        self.queue.clear_queue().await
    }

    pub async fn retry_failed_operations(&self) -> usize {
        self.queue.retry_failed_operations().await
    }

    pub async fn clear_failed(&self) -> usize {
        self.queue.clear_failed().await
    }

    pub fn clear_errors(&self) -> usize {
        self.recovery.clear_errors()
    }

    /// Host link event (e.g. the OS online/offline signal).
    pub async fn set_link_up(&self, up: bool) -> NetworkStatus {
        self.monitor.set_link_up(up).await
    }

    /// Drop cached entries whose key contains `pattern` (all if `None`).
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        self.cache.invalidate(pattern).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    #[must_use]
    pub fn subscribe_queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue.subscribe()
    }

    #[must_use]
    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.status()
    }

    #[must_use]
    pub fn subscribe_network(&self) -> watch::Receiver<NetworkStatus> {
        self.monitor.subscribe()
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    #[must_use]
    pub fn failed_operations(&self) -> Vec<FailedOperation> {
        self.queue.failed_operations()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<AppError> {
        self.recovery.errors()
    }

    #[must_use]
    pub fn error_stats(&self) -> ErrorStats {
        self.recovery.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WritePolicy;
    use crate::clock::ManualClock;
    use crate::network::ManualProbe;
    use crate::recovery::{ErrorType, RecoveryOutcome};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build(probe: Arc<ManualProbe>) -> (OfflineSync, Arc<dyn KvStore>) {
        let config = OfflineSyncConfig {
            auto_recovery: false,
            ..Default::default()
        };
        let clock: SharedClock = Arc::new(ManualClock::new(1_000_000));
        let memory: Arc<dyn KvStore> = Arc::new(InMemoryStore::named("memory", None));
        let durable: Arc<dyn KvStore> = Arc::new(InMemoryStore::named("durable", None));
        let cache = Arc::new(TieredCache::new(
            vec![
                CacheTier::new("memory", 0, memory),
                CacheTier::new("durable", 2, durable.clone()),
            ],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock.clone(),
        ));
        let monitor = Arc::new(NetworkMonitor::new(
            Some(probe as Arc<dyn ConnectivityProbe>),
            Duration::from_secs(30),
            Duration::from_secs(1),
        ));
        let sync = OfflineSync::from_parts(config, cache, durable.clone(), HandlerRegistry::new(), monitor, clock);
        (sync, durable)
    }

    #[tokio::test]
    async fn test_fetch_runs_source_once_and_caches() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        let sync = Arc::new(sync);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let sync = sync.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sync.fetch("deck:42", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!({"cards": 12}))
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"cards": 12}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Served from cache now
        let value = sync
            .fetch("deck:42", None, || async { Err(FetchError::failed("should not run")) })
            .await
            .unwrap();
        assert_eq!(value, json!({"cards": 12}));
    }

    #[tokio::test]
    async fn test_fetch_error_not_cached_and_recorded() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));

        let err = sync
            .fetch("deck:7", None, || async { Err(FetchError::failed("HTTP 503")) })
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::failed("HTTP 503"));
        assert!(sync.cache().get("deck:7").await.is_none());

        let errors = sync.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::Api);

        let value = sync
            .fetch("deck:7", None, || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        let mut state_rx = sync.state_receiver();
        assert_eq!(sync.state(), EngineState::Created);

        sync.start().await.unwrap();
        assert!(sync.is_running());
        assert_eq!(sync.network_status(), NetworkStatus::Online);
        assert!(matches!(sync.start().await, Err(EngineError::AlreadyStarted(EngineState::Running))));

        sync.shutdown().await;
        assert_eq!(sync.state(), EngineState::Stopped);
        assert!(state_rx.has_changed().unwrap());
        assert!(sync.tasks.lock().is_empty());
    }

    fn handler(sync: &OfflineSync) -> ComponentRecovery {
        ComponentRecovery {
            queue: Arc::downgrade(sync.queue()),
            cache: Arc::downgrade(sync.cache()),
            monitor: Arc::downgrade(sync.monitor()),
        }
    }

    #[tokio::test]
    async fn test_quota_error_recovery_drops_to_memory() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        sync.cache().set("a", json!(1), None).await.unwrap();

        let id = sync.recovery().report(
            ErrorType::Storage,
            "Storage quota exceeded",
            ErrorContext::new("storage"),
        );

        // Cleared and memory-only after the first strategy
        assert_eq!(sync.recovery().attempt_recovery(&id).await.unwrap(), RecoveryOutcome::Resolved);
        assert!(sync.cache().get("a").await.is_none());
        assert!(!sync.cache().tier("durable").unwrap().is_available());
        assert!(sync.cache().tier("memory").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_other_storage_error_only_clears() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        sync.cache().set("a", json!(1), None).await.unwrap();

        let id = sync.recovery().report(ErrorType::Storage, "database is locked", ErrorContext::new("storage"));
        assert_eq!(sync.recovery().attempt_recovery(&id).await.unwrap(), RecoveryOutcome::Resolved);
        assert!(sync.cache().get("a").await.is_none());
        assert!(sync.cache().tier("durable").unwrap().is_available());

        let error = sync.recovery().get(&id).unwrap();
        crate::recovery::RecoveryHandler::execute(&handler(&sync), crate::recovery::RecoveryAction::Reset, &error)
            .await
            .unwrap();
        assert!(!sync.cache().tier("durable").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_oversized_cache_write_escalates() {
        let config = OfflineSyncConfig {
            auto_recovery: false,
            ..Default::default()
        };
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let memory: Arc<dyn KvStore> = Arc::new(InMemoryStore::named("memory", Some(16)));
        let cache = Arc::new(TieredCache::new(
            vec![CacheTier::new("memory", 0, memory.clone())],
            WritePolicy::WriteThrough,
            Duration::from_secs(60),
            clock.clone(),
        ));
        let monitor = Arc::new(NetworkMonitor::new(None, Duration::from_secs(30), Duration::from_secs(1)));
        let sync = OfflineSync::from_parts(config, cache, memory, HandlerRegistry::new(), monitor, clock);

        assert!(sync.cache().set("deck:1", json!({"cards": [1, 2, 3]}), None).await.is_err());

        let errors = sync.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::Storage);
        assert_eq!(errors[0].context.component.as_deref(), Some("cache"));
    }

    #[tokio::test]
    async fn test_fallback_and_reload_need_a_cached_key() {
        use crate::recovery::{RecoveryAction, RecoveryError, RecoveryHandler};

        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        let recovery = handler(&sync);
        sync.cache().set("deck:1", json!(1), None).await.unwrap();

        let with_key = |key: &str| {
            let id = sync.recovery().report(
                ErrorType::Api,
                "HTTP 404",
                ErrorContext::default().with_action("fetch").with_detail("key", key),
            );
            sync.recovery().get(&id).unwrap()
        };

        let cached = with_key("deck:1");
        assert!(recovery.execute(RecoveryAction::FallbackToCache, &cached).await.is_ok());
        let missing = with_key("deck:2");
        assert!(matches!(
            recovery.execute(RecoveryAction::FallbackToCache, &missing).await,
            Err(RecoveryError::Failed(_))
        ));

        assert!(recovery.execute(RecoveryAction::Reload, &cached).await.is_ok());
        assert!(!sync.cache().exists("deck:1").await);

        let id = sync.recovery().report(ErrorType::Render, "widget crashed", ErrorContext::new("ui"));
        let keyless = sync.recovery().get(&id).unwrap();
        assert!(recovery.execute(RecoveryAction::Reload, &keyless).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_does_not_resolve_terminal_sync_failure() {
        use crate::recovery::{RecoveryAction, RecoveryHandler};

        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        let id = sync.recovery().report(
            ErrorType::Sync,
            "submit_answer failed after 3 attempt(s): HTTP 500",
            ErrorContext::new("queue").with_detail("operation_id", "op-1"),
        );
        let error = sync.recovery().get(&id).unwrap();

        assert!(handler(&sync).execute(RecoveryAction::Retry, &error).await.is_err());
    }

    #[tokio::test]
    async fn test_network_retry_needs_connectivity() {
        use crate::recovery::{RecoveryAction, RecoveryHandler};

        let reachability = Arc::new(ManualProbe::new(false));
        let (sync, _) = build(reachability.clone());
        let id = sync.recovery().report(ErrorType::Network, "connection refused", ErrorContext::default());
        let error = sync.recovery().get(&id).unwrap();

        assert!(handler(&sync).execute(RecoveryAction::Retry, &error).await.is_err());
        reachability.set_reachable(true);
        assert!(handler(&sync).execute(RecoveryAction::Retry, &error).await.is_ok());
        assert_eq!(sync.network_status(), NetworkStatus::Online);
    }

    #[tokio::test]
    async fn test_warm_fetches_missing_keys_only() {
        let (sync, _) = build(Arc::new(ManualProbe::new(true)));
        sync.cache().set("deck:1", json!("cached"), None).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let warmed = sync
            .warm(&["deck:1", "deck:2", "deck:bad"], None, move |key: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if key.ends_with("bad") {
                        Err(FetchError::failed("HTTP 500"))
                    } else {
                        Ok(json!({"key": key}))
                    }
                }
            })
            .await;

        assert_eq!(warmed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sync.cache().get("deck:2").await, Some(json!({"key": "deck:2"})));
        assert_eq!(sync.cache().get("deck:1").await, Some(json!("cached")));
    }

    #[tokio::test]
    async fn test_open_memory_only() {
        let sync = OfflineSync::open(OfflineSyncConfig::default(), HandlerRegistry::new(), None).await;
        assert_eq!(sync.cache().tiers().len(), 1);
        assert!(sync.durable.is_none());
    }

    #[tokio::test]
    async fn test_open_with_paths_persists_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = OfflineSyncConfig {
            local_store_path: Some(dir.path().join("local.json").to_string_lossy().into_owned()),
            durable_store_path: Some(dir.path().join("offline.db").to_string_lossy().into_owned()),
            auto_recovery: false,
            ..Default::default()
        };
        let probe = Arc::new(ManualProbe::new(false));

        let sync = OfflineSync::open(config.clone(), HandlerRegistry::new(), Some(probe.clone() as Arc<dyn ConnectivityProbe>)).await;
        assert_eq!(sync.cache().tiers().len(), 3);
        sync.start().await.unwrap();
        sync.set_link_up(false).await;
        let id = sync
            .enqueue(OperationType::SubmitAnswer, json!({"card": 1}), EnqueueOptions::default())
            .await;
        sync.shutdown().await;

        let reopened = OfflineSync::open(config, HandlerRegistry::new(), Some(probe as Arc<dyn ConnectivityProbe>)).await;
        reopened.start().await.unwrap();
        let pending = reopened.queue().pending_operations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        reopened.shutdown().await;
    }
}
