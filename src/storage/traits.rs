use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage quota exceeded: need {needed} bytes, {available} available (capacity {capacity})")]
    CapacityExceeded {
        needed: u64,
        available: u64,
        capacity: u64,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Quota failures mean the backend can't take further writes.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Space accounting for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    /// Bytes currently used (keys + serialized values)
    pub used: u64,
    /// Bytes the backend accepts (None = unbounded)
    pub capacity: Option<u64>,
}

impl StorageUsage {
    /// Fraction of capacity in use (0.0 for unbounded backends).
    #[must_use]
    pub fn ratio(&self) -> f64 {
        match self.capacity {
            Some(cap) if cap > 0 => self.used as f64 / cap as f64,
            _ => 0.0,
        }
    }
}

/// Bytes a key/value pair occupies for quota purposes.
pub fn entry_size(key: &str, value: &Value) -> Result<u64, StorageError> {
    Ok((key.len() + serde_json::to_vec(value)?.len()) as u64)
}

/// Reject a write that would push `used` past `capacity`.
///
/// `replaced` is the size of the entry being overwritten (0 for new keys).
pub fn check_capacity(
    capacity: Option<u64>,
    used: u64,
    replaced: u64,
    incoming: u64,
) -> Result<(), StorageError> {
    if let Some(capacity) = capacity {
        let after = used.saturating_sub(replaced) + incoming;
        if after > capacity {
            return Err(StorageError::CapacityExceeded {
                needed: incoming,
                available: capacity.saturating_sub(used.saturating_sub(replaced)),
                capacity,
            });
        }
    }
    Ok(())
}

/// Asynchronous key/value backend.
///
/// `read` of a missing key is `Ok(None)`, never an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &str;

    async fn read(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn write(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
    async fn usage(&self) -> Result<StorageUsage, StorageError>;

    /// Keys starting with `prefix`.
    /// Default implementation filters [`keys`](Self::keys).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
