// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A cached value plus the metadata needed to judge freshness.
///
/// Stored as JSON in every tier, so a value promoted from a slower tier
/// keeps its original write time and expires on the same schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    /// Write time (epoch millis)
    pub timestamp: i64,
    /// Time to live in millis
    pub ttl: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, data: Value, now_ms: i64, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            data,
            timestamp: now_ms,
            ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// `now - timestamp > ttl`
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.timestamp) > i64::try_from(self.ttl).unwrap_or(i64::MAX)
    }

    /// Millis left before expiry (0 once expired).
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> u64 {
        let age = now_ms.saturating_sub(self.timestamp).max(0) as u64;
        self.ttl.saturating_sub(age)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
