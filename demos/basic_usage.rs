// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Opening the coordinator with file + SQLite tiers in a temp dir
//! 2. Queueing answers while offline
//! 3. Reconnecting and watching the queue drain
//! 4. Deduplicated, cached fetches
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use offline_sync::{
    ConnectivityProbe, EnqueueOptions, FnHandler, HandlerRegistry, ManualProbe, OfflineSync, OfflineSyncConfig,
    OperationType, Priority, QueuedOperation,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    let dir = tempfile::tempdir()?;
    let config = OfflineSyncConfig {
        local_store_path: Some(dir.path().join("local.json").to_string_lossy().into_owned()),
        durable_store_path: Some(dir.path().join("durable.db").to_string_lossy().into_owned()),
        inter_operation_delay_ms: 10,
        ..Default::default()
    };

    let handlers = HandlerRegistry::new().with(
        OperationType::SubmitAnswer,
        Arc::new(FnHandler::new(|op: QueuedOperation| async move {
            println!("   → API received answer {}", op.payload);
            Ok(json!({"accepted": true}))
        })),
    );

    // Starts unreachable so the answers below are queued
    let probe = Arc::new(ManualProbe::new(false));
    let sync = OfflineSync::open(config, handlers, Some(probe.clone() as Arc<dyn ConnectivityProbe>)).await;
    sync.start().await?;
    sync.set_link_up(false).await;
    println!("\nNetwork: {}", sync.network_status());

    for card in 1..=3 {
        sync.enqueue(
            OperationType::SubmitAnswer,
            json!({"card": card, "answer": card % 2}),
            EnqueueOptions::default().with_priority(Priority::High),
        )
        .await;
    }
    println!("Queued while offline: {}", sync.queue_snapshot().queue_size);

    probe.set_reachable(true);
    println!("Network: {}", sync.set_link_up(true).await);
    for _ in 0..100 {
        if sync.queue_snapshot().queue_size == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = sync.queue_snapshot();
    println!("After reconnect: {} pending, last sync {:?}", snapshot.queue_size, snapshot.last_sync);

    for _ in 0..2 {
        let deck = sync
            .fetch("deck:spanish-101", Some(Duration::from_secs(60)), || async {
                Ok(json!({"cards": 120, "due": 14}))
            })
            .await?;
        println!("Deck: {deck}");
    }
    let cache = sync.cache_metrics();
    println!("Cache: {} hits, {} misses, hit rate {:.2}", cache.hits, cache.misses, cache.hit_rate);

    println!("\nMetrics:");
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        let value = match value {
            DebugValue::Counter(n) => n.to_string(),
            DebugValue::Gauge(g) => format!("{}", g.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        println!("   {} = {}", key.key().name(), value);
    }

    sync.shutdown().await;
    println!("\nState: {}", sync.state());
    Ok(())
}
