//! Key/value backends behind the cache tiers and the operation queue.
//!
//! - [`memory::InMemoryStore`]: DashMap, no persistence
//! - [`file::FileStore`]: size-bounded JSON file (local tier)
//! - [`sql::SqlStore`]: SQLite via sqlx (durable tier, queue)

pub mod traits;
pub mod memory;
pub mod file;
pub mod sql;

pub use traits::{KvStore, StorageError, StorageUsage};
pub use memory::InMemoryStore;
pub use file::FileStore;
pub use sql::SqlStore;
