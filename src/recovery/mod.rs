// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error recovery manager.
//!
//! Every error recorded here is classified into a type and severity and gets
//! the default strategy chain for its type. Recovery walks the chain:
//!
//! ```text
//!   attempt ──ok──► resolved
//!      │
//!      └─fail─► attempts += 1 ──(== max_attempts)──► next strategy, attempts = 0
//!                                                       │
//!                                                 (none left) ──► exhausted
//! ```
//!
//! At most one attempt per error runs at a time. Actions are carried out by
//! the host's [`RecoveryHandler`]; `Manual` never succeeds on its own.

pub mod classify;
pub mod types;

pub use classify::{classify, default_strategies, severity_for};
pub use types::{
    AppError, ErrorContext, ErrorStats, ErrorType, RecoveryAction, RecoveryError, RecoveryOutcome,
    RecoveryStrategy, Severity,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::OfflineSyncConfig;

/// Carries out recovery actions.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn execute(&self, action: RecoveryAction, error: &AppError) -> Result<(), RecoveryError>;
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub max_errors: usize,
    pub auto_recovery: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self::from(&OfflineSyncConfig::default())
    }
}

impl From<&OfflineSyncConfig> for RecoverySettings {
    fn from(config: &OfflineSyncConfig) -> Self {
        Self {
            max_errors: config.max_errors.max(1),
            auto_recovery: config.auto_recovery,
        }
    }
}

struct Inner {
    errors: RwLock<VecDeque<AppError>>,
    in_progress: Mutex<HashSet<String>>,
    handler: RwLock<Option<Arc<dyn RecoveryHandler>>>,
    settings: RecoverySettings,
    clock: SharedClock,
}

/// Removes the id from the in-progress set when the attempt ends.
struct AttemptGuard<'a> {
    in_progress: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.lock().remove(&self.id);
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ErrorRecoveryManager {
    inner: Arc<Inner>,
}

impl ErrorRecoveryManager {
    pub fn new(settings: RecoverySettings, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                errors: RwLock::new(VecDeque::new()),
                in_progress: Mutex::new(HashSet::new()),
                handler: RwLock::new(None),
                settings,
                clock,
            }),
        }
    }

    /// Install the action handler. Until one is installed every action fails.
    pub fn set_handler(&self, handler: Arc<dyn RecoveryHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recording
    // ═══════════════════════════════════════════════════════════════════════

    /// Record an error of unknown type; classified from its message and
    /// source chain. Returns the error id.
    pub fn handle_error(&self, err: &(dyn std::error::Error + 'static), context: ErrorContext) -> String {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        let error_type = classify(&message, &context);
        self.record(error_type, message, context, true)
    }

    /// Record an error whose type the caller already knows.
    pub fn report(&self, error_type: ErrorType, message: impl Into<String>, context: ErrorContext) -> String {
        self.record(error_type, message.into(), context, true)
    }

    fn record(&self, error_type: ErrorType, message: String, context: ErrorContext, blocking: bool) -> String {
        let severity = severity_for(error_type, &message);
        let app_error = AppError {
            id: format!("err_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            timestamp: self.inner.clock.now_ms(),
            error_type,
            severity,
            message,
            context,
            strategies: default_strategies(error_type),
            strategy_index: 0,
            attempts: 0,
            resolved: false,
        };
        let id = app_error.id.clone();

        match severity {
            Severity::Critical | Severity::High => error!(
                id = %id, error_type = %error_type, severity = %severity,
                component = ?app_error.context.component, message = %app_error.message,
                "Error recorded"
            ),
            Severity::Medium => warn!(
                id = %id, error_type = %error_type, severity = %severity,
                component = ?app_error.context.component, message = %app_error.message,
                "Error recorded"
            ),
            Severity::Low => info!(
                id = %id, error_type = %error_type, severity = %severity,
                message = %app_error.message,
                "Error recorded"
            ),
        }
        crate::metrics::record_error(error_type.as_str(), severity.as_str());

        let auto = self.inner.settings.auto_recovery
            && app_error.recovery().is_some_and(|s| s.action != RecoveryAction::Manual);

        {
            let guard = if blocking {
                Some(self.inner.errors.write())
            } else {
                self.inner.errors.try_write()
            };
            let Some(mut errors) = guard else {
                return id;
            };
            errors.push_back(app_error);
            while errors.len() > self.inner.settings.max_errors {
                errors.pop_front();
            }
        }

        if auto && blocking {
            self.spawn_attempt(id.clone());
        }
        id
    }

    fn spawn_attempt(&self, id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(id = %id, "No runtime, skipping automatic recovery");
            return;
        };
        let manager = self.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.attempt_recovery(&id).await {
                debug!(id = %id, error = %e, "Automatic recovery skipped");
            }
        });
    }

    /// Funnel panics anywhere in the process into this manager. The
    /// previously installed hook still runs.
    pub fn install_panic_hook(&self) {
        let manager = self.clone();
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            let mut context = ErrorContext::new("panic");
            if let Some(location) = info.location() {
                context = context.with_detail("location", location.to_string());
            }
            // Never block inside the hook: the panic may hold our own lock
            manager.record(ErrorType::Unknown, format!("panic: {}", message), context, false);
            previous(info);
        }));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Run the active strategy once for `id`.
    pub async fn attempt_recovery(&self, id: &str) -> Result<RecoveryOutcome, RecoveryError> {
        if !self.inner.in_progress.lock().insert(id.to_string()) {
            return Ok(RecoveryOutcome::InProgress);
        }
        let _guard = AttemptGuard {
            in_progress: &self.inner.in_progress,
            id: id.to_string(),
        };

        let (strategy, snapshot) = {
            let errors = self.inner.errors.read();
            let error = errors
                .iter()
                .find(|e| e.id == id)
                .ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;
            if error.resolved {
                return Ok(RecoveryOutcome::Resolved);
            }
            if error.is_exhausted() {
                return Ok(RecoveryOutcome::Exhausted);
            }
            let Some(strategy) = error.recovery().copied() else {
                return Ok(RecoveryOutcome::Exhausted);
            };
            (strategy, error.clone())
        };

        if !strategy.delay().is_zero() {
            tokio::time::sleep(strategy.delay()).await;
        }

        let result = match strategy.action {
            RecoveryAction::Manual => Err(RecoveryError::ManualRequired),
            action => {
                let handler = self.inner.handler.read().clone();
                match handler {
                    Some(handler) => handler.execute(action, &snapshot).await,
                    None => Err(RecoveryError::NoHandler),
                }
            }
        };
        crate::metrics::record_recovery_attempt(strategy.action.as_str(), result.is_ok());

        let mut errors = self.inner.errors.write();
        let error = errors
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;

        match result {
            Ok(()) => {
                error.resolved = true;
                info!(id, action = %strategy.action, "Error recovered");
                Ok(RecoveryOutcome::Resolved)
            }
            Err(e) => {
                error.attempts += 1;
                debug!(id, action = %strategy.action, attempt = error.attempts, error = %e, "Recovery attempt failed");
                if error.attempts >= strategy.max_attempts {
                    if error.strategy_index + 1 < error.strategies.len() {
                        error.strategy_index += 1;
                        error.attempts = 0;
                        info!(
                            id,
                            next = ?error.recovery().map(|s| s.action),
                            "Recovery strategy exhausted, escalating"
                        );
                    } else {
                        warn!(id, "All recovery strategies exhausted");
                        return Ok(RecoveryOutcome::Exhausted);
                    }
                }
                Ok(RecoveryOutcome::Failed)
            }
        }
    }

    /// Mark an error resolved. Returns false for unknown ids.
    pub fn resolve(&self, id: &str) -> bool {
        let mut errors = self.inner.errors.write();
        match errors.iter_mut().find(|e| e.id == id) {
            Some(error) => {
                error.resolved = true;
                true
            }
            None => false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn get(&self, id: &str) -> Option<AppError> {
        self.inner.errors.read().iter().find(|e| e.id == id).cloned()
    }

    /// All recorded errors, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<AppError> {
        self.inner.errors.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn unresolved(&self) -> Vec<AppError> {
        self.inner.errors.read().iter().filter(|e| !e.resolved).cloned().collect()
    }

    /// Newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<AppError> {
        self.inner.errors.read().iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> ErrorStats {
        let hour_ago = self.inner.clock.now_ms() - 60 * 60 * 1000;
        let errors = self.inner.errors.read();

        let mut stats = ErrorStats {
            total: errors.len(),
            ..Default::default()
        };
        for error in errors.iter() {
            if !error.resolved {
                stats.unresolved += 1;
            }
            if error.timestamp >= hour_ago {
                stats.recent += 1;
            }
            *stats.by_type.entry(error.error_type.as_str().to_string()).or_default() += 1;
            *stats.by_severity.entry(error.severity.as_str().to_string()).or_default() += 1;
        }
        stats
    }

    /// Forget every error. Returns how many were dropped.
    pub fn clear_errors(&self) -> usize {
        let mut errors = self.inner.errors.write();
        let count = errors.len();
        errors.clear();
        count
    }
}
