// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, local, durable (cache tier name)
//! - `operation`: get, set, promote, delete, flush
//! - `op_type`: queued operation kind (submit-answer, ...)
//! - `status`: success, error, retry, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CACHE TIERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a tier lookup outcome (hit, miss, expired, error)
pub fn record_cache_lookup(tier: &str, outcome: &'static str) {
    counter!(
        "offline_sync_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a cache-level hit or miss (after all tiers were consulted)
pub fn record_cache_result(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "offline_sync_cache_requests_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a write into a tier
pub fn record_tier_write(tier: &str, operation: &'static str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "offline_sync_tier_writes_total",
        "tier" => tier.to_string(),
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Set current tier usage
pub fn set_tier_usage(tier: &str, used: u64, capacity: Option<u64>) {
    gauge!("offline_sync_tier_used_bytes", "tier" => tier.to_string()).set(used as f64);
    if let Some(capacity) = capacity {
        gauge!("offline_sync_tier_capacity_bytes", "tier" => tier.to_string()).set(capacity as f64);
    }
}

/// Set tier availability (1 = available)
pub fn set_tier_available(tier: &str, available: bool) {
    gauge!("offline_sync_tier_available", "tier" => tier.to_string())
        .set(if available { 1.0 } else { 0.0 });
}

/// Set pending write-back entries
pub fn set_write_back_pending(count: usize) {
    gauge!("offline_sync_write_back_pending").set(count as f64);
}

/// Record entries evicted from a full tier
pub fn record_evictions(tier: &str, count: usize) {
    counter!("offline_sync_cache_evictions_total", "tier" => tier.to_string()).increment(count as u64);
}

/// Record keys removed by invalidation
pub fn record_invalidation(count: usize) {
    counter!("offline_sync_cache_invalidated_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REQUEST DEDUPLICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record whether a request started a fetch ("leader") or joined one ("joined")
pub fn record_dedup(outcome: &'static str) {
    counter!(
        "offline_sync_dedup_requests_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Set in-flight deduplicated requests
pub fn set_in_flight_requests(count: usize) {
    gauge!("offline_sync_in_flight_requests").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a queued operation outcome
pub fn record_operation(op_type: &str, status: &'static str) {
    counter!(
        "offline_sync_operations_total",
        "op_type" => op_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record handler latency for one operation
pub fn record_operation_latency(op_type: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "op_type" => op_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current queue depth
pub fn set_queue_size(count: usize) {
    gauge!("offline_sync_queue_size").set(count as f64);
}

/// Set terminally failed operations awaiting user action
pub fn set_failed_operations(count: usize) {
    gauge!("offline_sync_failed_operations").set(count as f64);
}

/// Record a drain batch
pub fn record_drain(processed: usize, duration: Duration) {
    histogram!("offline_sync_drain_batch_size").record(processed as f64);
    histogram!("offline_sync_drain_seconds").record(duration.as_secs_f64());
}

/// Record a queue persistence failure (in-memory copy stays authoritative)
pub fn record_persist_error(operation: &'static str) {
    counter!(
        "offline_sync_queue_persist_errors_total",
        "operation" => operation
    )
    .increment(1);
}

/// Record queue state transitions
pub fn set_queue_state(state: &str) {
    counter!(
        "offline_sync_queue_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// NETWORK
// ═══════════════════════════════════════════════════════════════════════════

/// Set network status (0 = offline, 1 = poor, 2 = online)
pub fn set_network_status(level: u8) {
    gauge!("offline_sync_network_status").set(level as f64);
}

/// Record a connectivity probe
pub fn record_probe(outcome: &'static str, duration: Duration) {
    counter!(
        "offline_sync_probes_total",
        "outcome" => outcome
    )
    .increment(1);
    histogram!("offline_sync_probe_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS & RECOVERY
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(error_type: &str, severity: &str) {
    counter!(
        "offline_sync_errors_total",
        "error_type" => error_type.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

/// Record a recovery attempt
pub fn record_recovery_attempt(action: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "offline_sync_recovery_attempts_total",
        "action" => action.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record coordinator state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_tier_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: impl Into<String>, operation: &'static str) -> Self {
        Self {
            tier: tier.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.tier, self.operation, self.start.elapsed());
    }
}
