//! Multi-tier read cache.
//!
//! - [`CacheEntry`]: stored value plus write time and TTL
//! - [`CacheTier`]: one named backend in the lookup order
//! - [`TieredCache`]: fan-out reads/writes, promotion, expiry, invalidation

pub mod entry;
pub mod tier;
pub mod tiered;

pub use entry::CacheEntry;
pub use tier::{CacheTier, TierUsage};
pub use tiered::TieredCache;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// How a `set` fans out across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Every available tier, synchronously
    #[default]
    WriteThrough,
    /// Fastest tier now, slower tiers on the next flush
    WriteBack,
    /// Slower tiers only; the fastest tier fills on read
    WriteAround,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No cache tier is available")]
    NoTierAvailable,
    #[error("Every cache tier rejected '{key}': {source}")]
    AllTiersFailed {
        key: String,
        source: StorageError,
    },
    #[error("Cache value serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Counters exposed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub requests: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub deletes: u64,
    pub promotions: u64,
    /// Entries dropped to make room in a full tier
    pub evictions: u64,
    pub write_back_pending: usize,
}

/// Outcome of one write-back flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    /// Dropped because they expired before reaching the slower tiers
    pub expired: usize,
    pub remaining: usize,
}
