// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::storage::{KvStore, StorageError, StorageUsage};

/// One cache level: a backend plus its place in the lookup order.
///
/// Lower `priority` is checked first (faster, smaller). A tier whose backend
/// failed to initialize, or that was switched off at runtime, is skipped by
/// every read and write path.
pub struct CacheTier {
    name: String,
    priority: u8,
    store: Arc<dyn KvStore>,
    available: AtomicBool,
}

impl CacheTier {
    pub fn new(name: impl Into<String>, priority: u8, store: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            priority,
            store,
            available: AtomicBool::new(true),
        }
    }

    /// Tier whose backend failed to come up; kept for reporting only.
    pub fn unavailable(name: impl Into<String>, priority: u8, store: Arc<dyn KvStore>) -> Self {
        let tier = Self::new(name, priority, store);
        tier.available.store(false, Ordering::Release);
        tier
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        crate::metrics::set_tier_available(&self.name, available);
    }

    pub async fn usage(&self) -> Result<StorageUsage, StorageError> {
        self.store.usage().await
    }
}

impl std::fmt::Debug for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTier")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("backend", &self.store.name())
            .field("available", &self.is_available())
            .finish()
    }
}

/// Usage snapshot for one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierUsage {
    pub name: String,
    pub priority: u8,
    pub available: bool,
    pub used: u64,
    pub capacity: Option<u64>,
}
