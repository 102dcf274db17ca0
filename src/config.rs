//! Configuration for the offline sync core.
//!
//! # Example
//!
//! ```
//! use offline_sync::{OfflineSyncConfig, WritePolicy};
//!
//! // Minimal config (uses defaults)
//! let config = OfflineSyncConfig::default();
//! assert_eq!(config.queue_batch_size, 10);
//! assert_eq!(config.write_policy, WritePolicy::WriteThrough);
//!
//! // Deployment config, e.g. loaded from JSON
//! let config: OfflineSyncConfig = serde_json::from_str(r#"{
//!     "write_policy": "write_back",
//!     "write_back_flush_ms": 2000,
//!     "probe_url": "https://api.example.com"
//! }"#).unwrap();
//! assert_eq!(config.write_policy, WritePolicy::WriteBack);
//! assert_eq!(config.default_max_retries, 3);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::cache::WritePolicy;
use crate::resilience::retry::RetryConfig;

/// Configuration for the offline sync core.
///
/// All fields have sensible defaults. Configure `durable_store_path` and
/// `probe_url` for anything beyond an in-memory session.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSyncConfig {
    /// Max operations handled per drain batch
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,

    /// Retry budget for operations that don't set their own
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Backoff base and cap
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Pause between operations inside one batch
    #[serde(default = "default_inter_operation_delay_ms")]
    pub inter_operation_delay_ms: u64,

    /// Delay before the next batch when ready operations remain
    #[serde(default = "default_redrain_delay_ms")]
    pub redrain_delay_ms: u64,

    /// Cache write policy
    #[serde(default)]
    pub write_policy: WritePolicy,

    /// Write-back flush interval
    #[serde(default = "default_write_back_flush_ms")]
    pub write_back_flush_ms: u64,

    /// TTL applied when callers don't pass one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Tier capacities in bytes
    #[serde(default = "default_memory_tier_max_bytes")]
    pub memory_tier_max_bytes: u64,
    #[serde(default = "default_local_tier_max_bytes")]
    pub local_tier_max_bytes: u64,
    #[serde(default = "default_durable_tier_max_bytes")]
    pub durable_tier_max_bytes: u64,

    /// JSON file for the size-bounded local tier (None = tier disabled)
    #[serde(default)]
    pub local_store_path: Option<String>,

    /// SQLite file for the durable tier and the operation queue
    /// (None = queue is memory-only)
    #[serde(default)]
    pub durable_store_path: Option<String>,

    /// Base URL probed for connectivity (None = trust link events only)
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Schedule a recovery attempt as soon as an error is recorded
    #[serde(default = "default_auto_recovery")]
    pub auto_recovery: bool,

    /// Max error records kept before the oldest are dropped
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

fn default_queue_batch_size() -> usize { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_inter_operation_delay_ms() -> u64 { 100 }
fn default_redrain_delay_ms() -> u64 { 1000 }
fn default_write_back_flush_ms() -> u64 { 5000 }
fn default_ttl_ms() -> u64 { 5 * 60 * 1000 } // 5 minutes
fn default_memory_tier_max_bytes() -> u64 { 16 * 1024 * 1024 } // 16 MB
fn default_local_tier_max_bytes() -> u64 { 5 * 1024 * 1024 } // 5 MB
fn default_durable_tier_max_bytes() -> u64 { 50 * 1024 * 1024 } // 50 MB
fn default_probe_interval_ms() -> u64 { 30_000 }
fn default_probe_timeout_ms() -> u64 { 5000 }
fn default_auto_recovery() -> bool { true }
fn default_max_errors() -> usize { 1000 }

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            queue_batch_size: default_queue_batch_size(),
            default_max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            inter_operation_delay_ms: default_inter_operation_delay_ms(),
            redrain_delay_ms: default_redrain_delay_ms(),
            write_policy: WritePolicy::default(),
            write_back_flush_ms: default_write_back_flush_ms(),
            default_ttl_ms: default_ttl_ms(),
            memory_tier_max_bytes: default_memory_tier_max_bytes(),
            local_tier_max_bytes: default_local_tier_max_bytes(),
            durable_tier_max_bytes: default_durable_tier_max_bytes(),
            local_store_path: None,
            durable_store_path: None,
            probe_url: None,
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            auto_recovery: default_auto_recovery(),
            max_errors: default_max_errors(),
        }
    }
}

impl OfflineSyncConfig {
    /// Backoff settings for queued operations.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
            max_retries: Some(self.default_max_retries as usize),
        }
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_serde_defaults() {
        let from_empty: OfflineSyncConfig = serde_json::from_str("{}").unwrap();
        let default = OfflineSyncConfig::default();

        assert_eq!(from_empty.queue_batch_size, default.queue_batch_size);
        assert_eq!(from_empty.default_max_retries, default.default_max_retries);
        assert_eq!(from_empty.retry_max_delay_ms, default.retry_max_delay_ms);
        assert_eq!(from_empty.write_policy, default.write_policy);
        assert_eq!(from_empty.local_tier_max_bytes, 5 * 1024 * 1024);
        assert!(from_empty.auto_recovery);
    }

    #[test]
    fn test_retry_config_from_settings() {
        let config = OfflineSyncConfig {
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
            default_max_retries: 7,
            ..Default::default()
        };

        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_millis(4000));
        assert_eq!(retry.max_retries, Some(7));
    }
}
