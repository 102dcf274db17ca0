// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue status, snapshots and errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::operation::QueuedOperation;
use crate::network::NetworkStatus;
use crate::storage::StorageError;

/// Sync state of the queue as a whole.
///
/// ```text
///   Idle ──drain──► Syncing ──batch done──► Idle
///                      │
///                      └── handler panic ──► Error ──start_sync──► Idle
///   any ──stop_sync──► Paused ──start_sync──► Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Paused,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Error => write!(f, "Error"),
            SyncStatus::Paused => write!(f, "Paused"),
        }
    }
}

/// What the UI renders for the sync indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub status: SyncStatus,
    pub network_status: NetworkStatus,
    pub queue_size: usize,
    /// Last time a drain applied at least one operation (epoch millis)
    pub last_sync: Option<i64>,
    pub failed_count: usize,
    pub last_error: Option<String>,
}

/// Outcome of one drain batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub remaining: usize,
    /// When the sync worker should drain again (None = wait for a trigger)
    pub next_drain_in: Option<Duration>,
}

impl DrainReport {
    /// Report for a drain that was skipped.
    pub(crate) fn skipped(remaining: usize) -> Self {
        Self {
            remaining,
            ..Default::default()
        }
    }
}

/// An operation that exhausted its retries or was rejected outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: QueuedOperation,
    pub error: String,
    /// Epoch millis
    pub failed_at: i64,
    /// Id of the matching record in the error recovery manager
    #[serde(default)]
    pub error_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Operation serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Operation not found: {0}")]
    NotFound(String),
}
