// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued mutations and their optimistic cache updates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Kinds of mutation the client replays against the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    SubmitAnswer,
    SubmitBatch,
    UpdateProgress,
    UpdateSettings,
    UpdateExamSettings,
    UpdateProfile,
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::SubmitAnswer => "submit-answer",
            OperationType::SubmitBatch => "submit-batch",
            OperationType::UpdateProgress => "update-progress",
            OperationType::UpdateSettings => "update-settings",
            OperationType::UpdateExamSettings => "update-exam-settings",
            OperationType::UpdateProfile => "update-profile",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain order: every `High` before any `Medium`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Pure transform over the currently cached value.
/// `None` in means nothing cached; `None` out means delete the key.
pub type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;

/// Local cache mutation applied at enqueue time and undone if the
/// operation fails terminally.
///
/// Closures can't be persisted, so after a restart the operation is still
/// replayed but carries no rollback.
#[derive(Clone)]
pub struct OptimisticUpdate {
    pub cache_key: String,
    /// TTL for the values written (None = cache default)
    pub ttl: Option<Duration>,
    apply: UpdateFn,
    rollback: UpdateFn,
}

impl OptimisticUpdate {
    pub fn new<A, R>(cache_key: impl Into<String>, apply: A, rollback: R) -> Self
    where
        A: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
        R: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            cache_key: cache_key.into(),
            ttl: None,
            apply: Arc::new(apply),
            rollback: Arc::new(rollback),
        }
    }

    /// Replace the cached value; rollback restores whatever was there
    /// before (or removes the key if nothing was).
    pub fn replace(cache_key: impl Into<String>, value: Value) -> Self {
        let previous: Arc<Mutex<Option<Option<Value>>>> = Arc::new(Mutex::new(None));
        let saved = Arc::clone(&previous);

        Self::new(
            cache_key,
            move |current| {
                *saved.lock() = Some(current.cloned());
                Some(value.clone())
            },
            move |_current| previous.lock().clone().flatten(),
        )
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        (self.apply)(current)
    }

    #[must_use]
    pub fn rollback(&self, current: Option<&Value>) -> Option<Value> {
        (self.rollback)(current)
    }
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("cache_key", &self.cache_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// A pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// UUID v4
    pub id: String,
    pub op_type: OperationType,
    pub payload: Value,
    /// Creation time (epoch millis)
    pub timestamp: i64,
    /// Enqueue order; breaks ties between operations created in the same millisecond
    #[serde(default)]
    pub seq: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    /// Not drained before this time (epoch millis)
    pub next_attempt_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub optimistic_update: Option<OptimisticUpdate>,
}

impl QueuedOperation {
    pub fn new(op_type: OperationType, payload: Value, now_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            payload,
            timestamp: now_ms,
            seq: 0,
            retry_count: 0,
            max_retries: 3,
            priority: Priority::default(),
            next_attempt_at: now_ms,
            last_error: None,
            optimistic_update: None,
        }
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic_update = Some(update);
        self
    }

    #[must_use]
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.next_attempt_at <= now_ms
    }

    /// Drain order: higher priority first, then older, then enqueue order.
    pub fn drain_order(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.seq.cmp(&b.seq))
            .then_with(|| a.id.cmp(&b.id))
    }
}
