//! Per-call enqueue options.
//!
//! # Example
//!
//! ```rust
//! use offline_sync::queue::{EnqueueOptions, Priority};
//!
//! // Default: medium priority, configured retry budget
//! let opts = EnqueueOptions::default();
//! assert_eq!(opts.priority, Priority::Medium);
//!
//! // Answers go out first and get a bigger budget
//! let opts = EnqueueOptions::urgent().with_max_retries(5);
//! assert_eq!(opts.priority, Priority::High);
//! assert_eq!(opts.max_retries, Some(5));
//! ```

use super::operation::{OptimisticUpdate, Priority};

/// Options for one `enqueue` call.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Drain priority.
    ///
    /// Default: `Medium`
    pub priority: Priority,

    /// Retry budget. `None` uses the queue's configured default.
    pub max_retries: Option<u32>,

    /// Cache mutation applied now and rolled back on terminal failure.
    pub optimistic: Option<OptimisticUpdate>,
}

impl EnqueueOptions {
    /// High priority: user-visible results such as submitted answers.
    #[must_use]
    pub fn urgent() -> Self {
        Self {
            priority: Priority::High,
            ..Default::default()
        }
    }

    /// Low priority: settings and other state nobody is waiting on.
    #[must_use]
    pub fn background() -> Self {
        Self {
            priority: Priority::Low,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic = Some(update);
        self
    }
}
