// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Network,
    Storage,
    Api,
    Validation,
    Sync,
    Cache,
    Render,
    Unknown,
}

impl ErrorType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Storage => "storage",
            ErrorType::Api => "api",
            ErrorType::Validation => "validation",
            ErrorType::Sync => "sync",
            ErrorType::Cache => "cache",
            ErrorType::Render => "render",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run the failed work (for sync errors: kick a drain)
    Retry,
    /// Serve cached data and carry on
    FallbackToCache,
    /// Drop cached data
    ClearCache,
    /// Fall back to memory-only operation
    Reset,
    /// Ask the host to reload its view
    Reload,
    /// Needs the user; never succeeds automatically
    Manual,
}

impl RecoveryAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::FallbackToCache => "fallback_to_cache",
            RecoveryAction::ClearCache => "clear_cache",
            RecoveryAction::Reset => "reset",
            RecoveryAction::Reload => "reload",
            RecoveryAction::Manual => "manual",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a recovery chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    pub max_attempts: u32,
    /// Wait before each attempt (millis)
    pub delay_ms: u64,
}

impl RecoveryStrategy {
    #[must_use]
    pub const fn new(action: RecoveryAction, max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            action,
            max_attempts,
            delay_ms,
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    /// Reporting component (queue, cache, storage, network, ...)
    pub component: Option<String>,
    /// What it was doing
    pub action: Option<String>,
    pub details: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A recorded error and its recovery progress.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub id: String,
    /// Epoch millis
    pub timestamp: i64,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub strategies: Vec<RecoveryStrategy>,
    pub strategy_index: usize,
    /// Failed attempts of the active strategy
    pub attempts: u32,
    pub resolved: bool,
}

impl AppError {
    /// The active strategy.
    #[must_use]
    pub fn recovery(&self) -> Option<&RecoveryStrategy> {
        self.strategies.get(self.strategy_index)
    }

    /// Every strategy has used up its attempts.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        match self.recovery() {
            None => true,
            Some(s) => self.strategy_index + 1 >= self.strategies.len() && self.attempts >= s.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Resolved,
    /// Attempt failed; budget remains (possibly in the next strategy)
    Failed,
    /// No strategy left; the error stays unresolved
    Exhausted,
    /// Another attempt for the same error is running
    InProgress,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Unknown error id: {0}")]
    NotFound(String),
    #[error("Manual intervention required")]
    ManualRequired,
    #[error("No recovery handler installed")]
    NoHandler,
    #[error("Recovery action failed: {0}")]
    Failed(String),
}

/// Counts for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub unresolved: usize,
    /// Recorded within the last hour
    pub recent: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
}
