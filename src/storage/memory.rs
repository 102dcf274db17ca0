use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use super::traits::{check_capacity, entry_size, KvStore, StorageError, StorageUsage};

/// Process-local backend. Nothing survives a restart.
pub struct InMemoryStore {
    name: String,
    data: DashMap<String, (Value, u64)>,
    /// Bytes in use; the lock also serializes capacity checks with inserts
    used: Mutex<u64>,
    capacity: Option<u64>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory", None)
    }

    /// Memory store that rejects writes past `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self::named("memory", Some(capacity))
    }

    #[must_use]
    pub fn named(name: impl Into<String>, capacity: Option<u64>) -> Self {
        Self {
            name: name.into(),
            data: DashMap::new(),
            used: Mutex::new(0),
            capacity,
        }
    }

    /// Get current item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().0.clone()))
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let size = entry_size(key, value)?;
        let mut used = self.used.lock();
        let replaced = self.data.get(key).map(|r| r.value().1).unwrap_or(0);
        check_capacity(self.capacity, *used, replaced, size)?;
        self.data.insert(key.to_string(), (value.clone(), size));
        *used = used.saturating_sub(replaced) + size;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut used = self.used.lock();
        if let Some((_, (_, size))) = self.data.remove(key) {
            *used = used.saturating_sub(size);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut used = self.used.lock();
        self.data.clear();
        *used = 0;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.iter().map(|r| r.key().clone()).collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        Ok(StorageUsage {
            used: *self.used.lock(),
            capacity: self.capacity,
        })
    }
}
