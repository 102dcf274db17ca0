// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote API seam for queued operations.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use super::operation::{OperationType, QueuedOperation};

/// Failure reported by an [`OperationHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// Transient failure; the queue will replay the operation.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// The server rejected the operation; replaying won't help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Applies one operation type against the API.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn apply(&self, op: &QueuedOperation) -> Result<Value, HandlerError>;
}

/// Adapter so a plain async closure can serve as a handler.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(QueuedOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F, Fut>
where
    F: Fn(QueuedOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn apply(&self, op: &QueuedOperation) -> Result<Value, HandlerError> {
        (self.f)(op.clone()).await
    }
}

/// Handlers keyed by operation type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, op_type: OperationType, handler: Arc<dyn OperationHandler>) -> Self {
        self.register(op_type, handler);
        self
    }

    pub fn register(&mut self, op_type: OperationType, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(op_type, handler);
    }

    #[must_use]
    pub fn get(&self, op_type: OperationType) -> Option<&Arc<dyn OperationHandler>> {
        self.handlers.get(&op_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(|op: QueuedOperation| async move {
            Ok(json!({"echo": op.payload}))
        });
        let op = QueuedOperation::new(OperationType::SubmitAnswer, json!(3), 0);
        assert_eq!(handler.apply(&op).await.unwrap(), json!({"echo": 3}));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new().with(
            OperationType::UpdateSettings,
            Arc::new(FnHandler::new(|_op: QueuedOperation| async { Ok(Value::Null) })),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get(OperationType::UpdateSettings).is_some());
        assert!(registry.get(OperationType::SubmitAnswer).is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert!(HandlerError::retryable("timeout").retryable);
        let permanent = HandlerError::permanent("422 invalid answer");
        assert!(!permanent.retryable);
        assert_eq!(permanent.to_string(), "422 invalid answer");
    }
}
