//! Integration tests for offline sync.
//!
//! End-to-end scenarios over the public API with real backends (SQLite in a
//! temp dir) and a scripted connectivity probe.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: offline queueing, replay, tiered reads
//! - `failure_*` - Failure scenarios: terminal failures, tier outages, restarts

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use offline_sync::{
    CacheEntry, CacheTier, ConnectivityProbe, EnqueueOptions, EngineState, ErrorType, FnHandler, HandlerError,
    HandlerRegistry, InMemoryStore, KvStore, ManualClock, ManualProbe, NetworkMonitor, NetworkStatus, OfflineQueue,
    OfflineSync, OfflineSyncConfig, OperationHandler, OperationType, OptimisticUpdate, Priority, QueuedOperation, SharedClock,
    SqlStore, SyncStatus, SystemClock, TieredCache, WritePolicy,
};
use offline_sync::queue::QueueSettings;

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> OfflineSyncConfig {
    OfflineSyncConfig {
        inter_operation_delay_ms: 0,
        redrain_delay_ms: 10,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        write_back_flush_ms: 50,
        auto_recovery: false,
        ..Default::default()
    }
}

/// Handler that counts calls and answers with `result`.
fn counting_handler(calls: Arc<AtomicUsize>, result: Result<Value, HandlerError>) -> Arc<dyn OperationHandler> {
    Arc::new(FnHandler::new(move |_op: QueuedOperation| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(result.clone())
    }))
}

/// Memory-only coordinator with a scripted probe.
fn memory_sync(handlers: HandlerRegistry, probe: Arc<ManualProbe>) -> OfflineSync {
    let config = fast_config();
    let clock: SharedClock = Arc::new(SystemClock);
    let memory: Arc<dyn KvStore> = Arc::new(InMemoryStore::named("memory", None));
    let cache = Arc::new(TieredCache::new(
        vec![CacheTier::new("memory", 0, memory.clone())],
        WritePolicy::WriteThrough,
        config.default_ttl(),
        clock.clone(),
    ));
    let monitor = Arc::new(NetworkMonitor::new(
        Some(probe as Arc<dyn ConnectivityProbe>),
        Duration::from_secs(60),
        Duration::from_secs(1),
    ));
    OfflineSync::from_parts(config, cache, memory, handlers, monitor, clock)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_offline_enqueue_then_reconnect_drains() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new().with(
        OperationType::SubmitAnswer,
        counting_handler(calls.clone(), Ok(json!({"accepted": true}))),
    );
    let probe = Arc::new(ManualProbe::new(false));
    let sync = memory_sync(handlers, probe.clone());

    sync.start().await.unwrap();
    sync.set_link_up(false).await;
    assert_eq!(sync.network_status(), NetworkStatus::Offline);

    sync.enqueue(
        OperationType::SubmitAnswer,
        json!({"card": 3, "answer": 1}),
        EnqueueOptions::default().with_priority(Priority::High),
    )
    .await;

    let snapshot = sync.queue_snapshot();
    assert_eq!(snapshot.queue_size, 1);
    assert_eq!(snapshot.status, SyncStatus::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    probe.set_reachable(true);
    assert_eq!(sync.set_link_up(true).await, NetworkStatus::Online);

    assert!(wait_until(|| sync.queue_snapshot().queue_size == 0).await);
    let snapshot = sync.queue_snapshot();
    assert!(snapshot.last_sync.is_some());
    assert_eq!(snapshot.network_status, NetworkStatus::Online);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sync.shutdown().await;
    assert_eq!(sync.state(), EngineState::Stopped);
}

#[tokio::test]
async fn happy_write_through_survives_durable_outage() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(SystemClock);
    let memory: Arc<dyn KvStore> = Arc::new(InMemoryStore::named("memory", None));
    let durable: Arc<dyn KvStore> = Arc::new(
        SqlStore::open_sqlite(&dir.path().join("cache.db").to_string_lossy(), None)
            .await
            .unwrap(),
    );
    let cache = TieredCache::new(
        vec![
            CacheTier::new("memory", 0, memory.clone()),
            CacheTier::new("durable", 2, durable.clone()),
        ],
        WritePolicy::WriteThrough,
        Duration::from_secs(300),
        clock,
    );

    cache
        .set("user:1", json!({"name": "A"}), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    for store in [&memory, &durable] {
        let raw = store.read("cache:user:1").await.unwrap().expect("entry in every tier");
        let entry = CacheEntry::from_value(raw).unwrap();
        assert_eq!(entry.data, json!({"name": "A"}));
        assert_eq!(entry.ttl, 60_000);
    }

    assert!(cache.set_tier_available("durable", false));
    assert_eq!(cache.get("user:1").await, Some(json!({"name": "A"})));
}

#[tokio::test]
async fn happy_fetch_deduplicates_and_fills_cache() {
    let sync = Arc::new(memory_sync(HandlerRegistry::new(), Arc::new(ManualProbe::new(true))));
    let calls = Arc::new(AtomicUsize::new(0));

    let fetches = (0..5).map(|_| {
        let sync = sync.clone();
        let calls = calls.clone();
        async move {
            sync.fetch("questions:topic-9", Some(Duration::from_secs(30)), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(json!(["q1", "q2"]))
            })
            .await
        }
    });
    let results = futures::future::join_all(fetches).await;

    assert!(results.iter().all(|r| r.as_ref().unwrap() == &json!(["q1", "q2"])));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sync.cache().get("questions:topic-9").await, Some(json!(["q1", "q2"])));
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
async fn failure_terminal_error_rolls_back_optimistic_update() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new().with(
        OperationType::UpdateProgress,
        counting_handler(calls.clone(), Err(HandlerError::permanent("HTTP 422 invalid progress"))),
    );
    let sync = memory_sync(handlers, Arc::new(ManualProbe::new(true)));
    sync.cache().set("progress:deck-1", json!({"score": 4}), None).await.unwrap();
    sync.start().await.unwrap();

    let id = sync
        .enqueue(
            OperationType::UpdateProgress,
            json!({"deck": 1, "score": 5}),
            EnqueueOptions::default()
                .with_optimistic(OptimisticUpdate::replace("progress:deck-1", json!({"score": 5}))),
        )
        .await;

    assert!(wait_until(|| sync.failed_operations().len() == 1).await);
    assert_eq!(sync.cache().get("progress:deck-1").await, Some(json!({"score": 4})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let failed = sync.failed_operations();
    assert_eq!(failed[0].operation.id, id);
    assert!(failed[0].error.contains("invalid progress"));
    assert!(sync.errors().iter().any(|e| e.error_type == ErrorType::Sync));

    sync.shutdown().await;
}

#[tokio::test]
async fn failure_restart_recovers_queue_with_retry_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db").to_string_lossy().into_owned();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let (_network_tx, network_rx) = watch::channel(NetworkStatus::Online);
    let settings = QueueSettings {
        inter_operation_delay: Duration::ZERO,
        ..QueueSettings::default()
    };

    let (id, payload) = {
        let store: Arc<dyn KvStore> = Arc::new(SqlStore::open_sqlite(&path, None).await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::new().with(
            OperationType::SubmitBatch,
            counting_handler(calls, Err(HandlerError::retryable("connection reset"))),
        );
        let queue = OfflineQueue::new(store, handlers, settings.clone(), clock.clone(), network_rx.clone());

        let payload = json!({"answers": [1, 2, 3]});
        let id = queue
            .enqueue(OperationType::SubmitBatch, payload.clone(), EnqueueOptions::default())
            .await;
        let report = queue.drain().await;
        assert_eq!(report.retried, 1);
        queue.persist_all().await.unwrap();
        (id, payload)
    };

    let store: Arc<dyn KvStore> = Arc::new(SqlStore::open_sqlite(&path, None).await.unwrap());
    let queue = OfflineQueue::new(store, HandlerRegistry::new(), settings, clock, network_rx);
    assert_eq!(queue.restore().await.unwrap(), 1);

    let ops = queue.pending_operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].id, id);
    assert_eq!(ops[0].payload, payload);
    assert_eq!(ops[0].retry_count, 1);
    assert!(ops[0].optimistic_update.is_none());
}

#[tokio::test]
async fn failure_paused_queue_does_not_drain_until_resumed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new().with(
        OperationType::UpdateSettings,
        counting_handler(calls.clone(), Ok(json!({}))),
    );
    let sync = memory_sync(handlers, Arc::new(ManualProbe::new(true)));
    sync.start().await.unwrap();

    sync.stop_sync();
    sync.enqueue(OperationType::UpdateSettings, json!({"theme": "dark"}), EnqueueOptions::default())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sync.queue_snapshot().status, SyncStatus::Paused);

    sync.start_sync();
    assert!(wait_until(|| sync.queue_snapshot().queue_size == 0).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sync.shutdown().await;
}
