// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Size-bounded JSON file store.
//!
//! The local tier: a small key/value store with a hard byte quota (5 MB by
//! default). The whole map lives in memory and every mutation rewrites the
//! backing file through a temp file + rename, so a crash leaves either the
//! old or the new snapshot on disk, never a torn one.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{check_capacity, entry_size, KvStore, StorageError, StorageUsage};

/// Default quota, the usual browser localStorage budget
pub const DEFAULT_FILE_CAPACITY: u64 = 5 * 1024 * 1024;

struct FileState {
    entries: BTreeMap<String, (Value, u64)>,
    used: u64,
}

pub struct FileStore {
    name: String,
    path: PathBuf,
    capacity: Option<u64>,
    state: Mutex<FileState>,
}

impl FileStore {
    /// Open the store at `path`, loading any previous snapshot.
    ///
    /// A corrupt snapshot is moved aside (`<path>.corrupt`) and the store
    /// starts empty rather than failing.
    pub async fn open(path: impl AsRef<Path>, capacity: Option<u64>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut entries = BTreeMap::new();
        let mut used = 0;

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => {
                    for (key, value) in map {
                        let size = entry_size(&key, &value)?;
                        used += size;
                        entries.insert(key, (value, size));
                    }
                    info!(path = %path.display(), entries = entries.len(), used, "Loaded file store snapshot");
                }
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!(path = %path.display(), error = %e, "File store snapshot is corrupt, starting empty");
                    tokio::fs::rename(&path, &aside).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No file store snapshot yet");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            name: "local".to_string(),
            path,
            capacity,
            state: Mutex::new(FileState { entries, used }),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &FileState) -> Result<(), StorageError> {
        let map: Map<String, Value> = state
            .entries
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect();
        let bytes = serde_json::to_vec(&map)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let size = entry_size(key, value)?;
        let mut state = self.state.lock().await;
        let replaced = state.entries.get(key).map(|(_, s)| *s).unwrap_or(0);
        check_capacity(self.capacity, state.used, replaced, size)?;

        let previous = state.entries.insert(key.to_string(), (value.clone(), size));
        state.used = state.used.saturating_sub(replaced) + size;

        if let Err(e) = self.persist(&state).await {
            // Keep memory and disk in step: undo the insert
            match previous {
                Some(prev) => {
                    state.entries.insert(key.to_string(), prev);
                }
                None => {
                    state.entries.remove(key);
                }
            }
            state.used = state.used.saturating_sub(size) + replaced;
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if let Some((_, size)) = state.entries.remove(key) {
            state.used = state.used.saturating_sub(size);
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.used = 0;
        self.persist(&state).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.entries.keys().cloned().collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let state = self.state.lock().await;
        Ok(StorageUsage {
            used: state.used,
            capacity: self.capacity,
        })
    }
}
