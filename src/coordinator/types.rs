//! Public types for the offline sync coordinator.

use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::traits::StorageError;

/// Coordinator lifecycle state.
///
/// Use [`super::OfflineSync::state()`] to check the current state or
/// [`super::OfflineSync::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not running
    Created,
    /// Queue restored, background tasks running
    Running,
    /// Stopping tasks, flushing write-back, persisting the queue
    ShuttingDown,
    /// Everything flushed; the instance can be dropped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Failure of a deduplicated [`fetch`](super::OfflineSync::fetch).
///
/// Clone because one result is handed to every joined caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The data source failed
    #[error("Fetch failed: {0}")]
    Source(String),
}

impl FetchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }
}

/// Startup failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine already started (state {0})")]
    AlreadyStarted(EngineState),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
