//! Recovery actions wired to the queue, cache and network monitor.
//!
//! An action returns `Ok` only when it actually dealt with the error; the
//! manager moves on to the next strategy otherwise.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

use crate::cache::TieredCache;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::queue::{OfflineQueue, SyncStatus};
use crate::recovery::{AppError, ErrorType, RecoveryAction, RecoveryError, RecoveryHandler, Severity};

/// Name of the tier kept when falling back to memory-only operation.
pub(super) const MEMORY_TIER: &str = "memory";

/// Holds weak references: the queue owns the recovery manager, which owns
/// this handler.
pub(super) struct ComponentRecovery {
    pub(super) queue: Weak<OfflineQueue>,
    pub(super) cache: Weak<TieredCache>,
    pub(super) monitor: Weak<NetworkMonitor>,
}

impl ComponentRecovery {
    fn queue(&self) -> Result<Arc<OfflineQueue>, RecoveryError> {
        self.queue.upgrade().ok_or(RecoveryError::NoHandler)
    }

    fn cache(&self) -> Result<Arc<TieredCache>, RecoveryError> {
        self.cache.upgrade().ok_or(RecoveryError::NoHandler)
    }

    async fn retry(&self, error: &AppError) -> Result<(), RecoveryError> {
        match error.error_type {
            ErrorType::Network => {
                let monitor = self.monitor.upgrade().ok_or(RecoveryError::NoHandler)?;
                match monitor.check_now().await {
                    NetworkStatus::Online => {
                        self.queue()?.trigger();
                        Ok(())
                    }
                    status => Err(RecoveryError::Failed(format!("network still {status}"))),
                }
            }
            ErrorType::Sync => {
                let queue = self.queue()?;
                if queue.status() == SyncStatus::Error {
                    queue.start_sync();
                    Ok(())
                } else {
                    Err(RecoveryError::Failed(
                        "operation is in the failed list; retry_failed_operations re-queues it".into(),
                    ))
                }
            }
            _ => {
                let queue = self.queue()?;
                if queue.is_empty() {
                    return Err(RecoveryError::Failed("nothing pending to retry".into()));
                }
                queue.trigger();
                Ok(())
            }
        }
    }

    /// Disable every tier but memory. Returns the number switched off.
    fn drop_to_memory(&self, cache: &TieredCache, error: &AppError) -> usize {
        let mut disabled = 0;
        for tier in cache.tiers() {
            if tier.name() != MEMORY_TIER && tier.is_available() {
                cache.set_tier_available(tier.name(), false);
                disabled += 1;
            }
        }
        warn!(id = %error.id, disabled, "Falling back to memory-only caching");
        disabled
    }
}

fn context_key(error: &AppError) -> Result<&str, RecoveryError> {
    error
        .context
        .details
        .get("key")
        .map(String::as_str)
        .ok_or_else(|| RecoveryError::Failed("error carries no cache key".into()))
}

#[async_trait]
impl RecoveryHandler for ComponentRecovery {
    async fn execute(&self, action: RecoveryAction, error: &AppError) -> Result<(), RecoveryError> {
        match action {
            RecoveryAction::Retry => self.retry(error).await,
            RecoveryAction::ClearCache => {
                let cache = self.cache()?;
                let cleared = cache.clear().await;
                info!(id = %error.id, cleared, "Cache cleared for recovery");
                // Out of space: the slower tiers can't be trusted with writes
                if error.error_type == ErrorType::Storage && error.severity == Severity::Critical {
                    self.drop_to_memory(&cache, error);
                }
                Ok(())
            }
            RecoveryAction::Reset => {
                let cache = self.cache()?;
                self.drop_to_memory(&cache, error);
                Ok(())
            }
            RecoveryAction::FallbackToCache => {
                let key = context_key(error)?;
                if self.cache()?.exists(key).await {
                    info!(id = %error.id, key, "Serving cached copy");
                    Ok(())
                } else {
                    Err(RecoveryError::Failed(format!("no cached copy of '{key}'")))
                }
            }
            RecoveryAction::Reload => {
                let key = context_key(error)?;
                self.cache()?
                    .delete(key)
                    .await
                    .map_err(|e| RecoveryError::Failed(e.to_string()))?;
                info!(id = %error.id, key, "Cached copy dropped for reload");
                Ok(())
            }
            RecoveryAction::Manual => Err(RecoveryError::ManualRequired),
        }
    }
}
