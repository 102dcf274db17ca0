//! # Offline Sync
//!
//! Offline-first data layer for a spaced-repetition quiz client: a durable
//! queue of user mutations replayed when connectivity returns, in front of a
//! tiered cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     UI / API callers                        │
//! │  • fetch(key, source) (deduplicated)                        │
//! │  • enqueue(op, payload, optimistic update)                  │
//! │  • watch snapshots: queue, network, errors                  │
//! └─────────────────────────────────────────────────────────────┘
//!            │ reads                          │ mutations
//!            ▼                                ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      Tiered Cache        │◄──│     Offline Queue            │
//! │  memory → local → SQLite │   │  priority + FIFO, backoff    │
//! │  TTL, promotion, policy  │   │  rollback on terminal fail   │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                             │ drain when Online
//!            ┌────────────────────┐           ▼
//!            │  Network Monitor   │──► OperationHandler (API)
//!            └────────────────────┘
//!                                 failures ──► Error Recovery Manager
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{
//!     EnqueueOptions, FnHandler, HandlerRegistry, OfflineSync, OfflineSyncConfig, OperationType,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let handlers = HandlerRegistry::new().with(
//!         OperationType::SubmitAnswer,
//!         Arc::new(FnHandler::new(|op: offline_sync::QueuedOperation| async move {
//!             // POST op.payload to the API
//!             Ok(json!({"ok": true, "id": op.id}))
//!         })),
//!     );
//!
//!     let config = OfflineSyncConfig {
//!         durable_store_path: Some("./offline.db".into()),
//!         probe_url: Some("https://api.example.com".into()),
//!         ..Default::default()
//!     };
//!     let sync = OfflineSync::open(config, handlers, None).await;
//!     sync.start().await.expect("Failed to start");
//!
//!     let deck = sync
//!         .fetch("deck:42", None, || async { Ok(json!({"cards": []})) })
//!         .await;
//!     println!("{:?}", deck);
//!
//!     sync.enqueue(
//!         OperationType::SubmitAnswer,
//!         json!({"card": 7, "correct": true}),
//!         EnqueueOptions::urgent(),
//!     )
//!     .await;
//!
//!     sync.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`OfflineSync`], the composition of everything below
//! - [`cache`]: tiered cache with write policies
//! - [`queue`]: durable offline operation queue
//! - [`dedup`]: in-flight request deduplication
//! - [`network`]: connectivity classification
//! - [`recovery`]: error classification and recovery strategies
//! - [`storage`]: key/value backends (memory, JSON file, SQLite)
//! - [`resilience`]: retry and backoff

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod metrics;
pub mod network;
pub mod queue;
pub mod recovery;
pub mod resilience;
pub mod storage;

pub use cache::{CacheEntry, CacheError, CacheMetrics, CacheTier, TieredCache, WritePolicy};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::OfflineSyncConfig;
pub use coordinator::{EngineError, EngineState, FetchError, OfflineSync};
pub use dedup::RequestDeduplicator;
pub use network::{ConnectivityProbe, HttpProbe, ManualProbe, NetworkMonitor, NetworkStatus, ProbeError};
pub use queue::{
    DrainReport, EnqueueOptions, FailedOperation, FnHandler, HandlerError, HandlerRegistry, OfflineQueue,
    OperationHandler, OperationType, OptimisticUpdate, Priority, QueueError, QueueSnapshot, QueuedOperation,
    SyncStatus,
};
pub use recovery::{
    AppError, ErrorContext, ErrorRecoveryManager, ErrorStats, ErrorType, RecoveryAction, RecoveryError,
    RecoveryHandler, RecoveryOutcome, Severity,
};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
pub use storage::{FileStore, InMemoryStore, KvStore, SqlStore, StorageError, StorageUsage};
