//! Keyword heuristics for errors whose type isn't known up front.

use super::types::{ErrorContext, ErrorType, RecoveryAction, RecoveryStrategy, Severity};

const STORAGE_TERMS: &[&str] = &["quota", "capacity", "storage", "disk", "database", "sqlite", "sql"];
const NETWORK_TERMS: &[&str] = &[
    "network", "connection", "connect", "timeout", "timed out", "offline", "unreachable", "dns",
];
const API_TERMS: &[&str] = &[
    "http", "status", "api", "unauthorized", "forbidden", "bad request", "server error", "400", "401", "403",
    "404", "409", "422", "429", "500", "502", "503", "504",
];
const VALIDATION_TERMS: &[&str] = &["validation", "invalid", "schema", "parse", "missing field", "expected"];
const SYNC_TERMS: &[&str] = &["sync", "queue", "conflict"];
const CACHE_TERMS: &[&str] = &["cache"];
const RENDER_TERMS: &[&str] = &["render", "component", "view"];

fn any_of(haystack: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| haystack.contains(t))
}

/// Classify from the reporting component first, then from the message
/// (including its source chain).
#[must_use]
pub fn classify(message: &str, context: &ErrorContext) -> ErrorType {
    if let Some(component) = context.component.as_deref() {
        match component {
            "queue" | "sync" => return ErrorType::Sync,
            "cache" => return ErrorType::Cache,
            "storage" => return ErrorType::Storage,
            "network" => return ErrorType::Network,
            "api" => return ErrorType::Api,
            "render" | "ui" => return ErrorType::Render,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if any_of(&lower, STORAGE_TERMS) {
        ErrorType::Storage
    } else if any_of(&lower, NETWORK_TERMS) {
        ErrorType::Network
    } else if any_of(&lower, API_TERMS) {
        ErrorType::Api
    } else if any_of(&lower, VALIDATION_TERMS) {
        ErrorType::Validation
    } else if any_of(&lower, SYNC_TERMS) {
        ErrorType::Sync
    } else if any_of(&lower, CACHE_TERMS) {
        ErrorType::Cache
    } else if any_of(&lower, RENDER_TERMS) {
        ErrorType::Render
    } else {
        ErrorType::Unknown
    }
}

#[must_use]
pub fn severity_for(error_type: ErrorType, message: &str) -> Severity {
    let lower = message.to_lowercase();
    if lower.starts_with("panic") {
        return Severity::Critical;
    }

    match error_type {
        ErrorType::Storage if any_of(&lower, &["quota", "capacity", "disk full"]) => Severity::Critical,
        ErrorType::Storage => Severity::High,
        ErrorType::Network if any_of(&lower, &["timeout", "timed out"]) => Severity::High,
        ErrorType::Network => Severity::Medium,
        ErrorType::Api if any_of(&lower, &["401", "403", "unauthorized", "forbidden", "500", "502", "503", "504"]) => {
            Severity::High
        }
        ErrorType::Api => Severity::Medium,
        ErrorType::Sync => Severity::High,
        ErrorType::Validation | ErrorType::Render => Severity::Medium,
        ErrorType::Cache | ErrorType::Unknown => Severity::Low,
    }
}

/// Recovery chain tried in order for each error type.
#[must_use]
pub fn default_strategies(error_type: ErrorType) -> Vec<RecoveryStrategy> {
    use RecoveryAction::*;

    match error_type {
        ErrorType::Network => vec![
            RecoveryStrategy::new(Retry, 3, 1000),
            RecoveryStrategy::new(FallbackToCache, 1, 0),
        ],
        ErrorType::Storage => vec![
            RecoveryStrategy::new(ClearCache, 1, 0),
            RecoveryStrategy::new(Reset, 1, 0),
        ],
        ErrorType::Api => vec![
            RecoveryStrategy::new(Retry, 2, 2000),
            RecoveryStrategy::new(FallbackToCache, 1, 0),
        ],
        ErrorType::Validation => vec![RecoveryStrategy::new(Manual, 1, 0)],
        ErrorType::Sync => vec![
            RecoveryStrategy::new(Retry, 3, 5000),
            RecoveryStrategy::new(Manual, 1, 0),
        ],
        ErrorType::Cache => vec![RecoveryStrategy::new(ClearCache, 1, 0)],
        ErrorType::Render => vec![RecoveryStrategy::new(Reload, 1, 0)],
        ErrorType::Unknown => vec![
            RecoveryStrategy::new(Retry, 1, 1000),
            RecoveryStrategy::new(Manual, 1, 0),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> ErrorContext {
        ErrorContext::default()
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(classify("Storage quota exceeded: need 10 bytes", &none()), ErrorType::Storage);
        assert_eq!(classify("connection refused", &none()), ErrorType::Network);
        assert_eq!(classify("request timed out", &none()), ErrorType::Network);
        assert_eq!(classify("HTTP 502 from upstream", &none()), ErrorType::Api);
        assert_eq!(classify("invalid answer index", &none()), ErrorType::Validation);
        assert_eq!(classify("merge conflict on progress", &none()), ErrorType::Sync);
        assert_eq!(classify("cache entry corrupt", &none()), ErrorType::Cache);
        assert_eq!(classify("something odd", &none()), ErrorType::Unknown);
    }

    #[test]
    fn test_component_wins_over_message() {
        let ctx = ErrorContext::new("queue");
        assert_eq!(classify("connection refused", &ctx), ErrorType::Sync);

        let ctx = ErrorContext::new("settings-panel");
        assert_eq!(classify("connection refused", &ctx), ErrorType::Network);
    }

    #[test]
    fn test_severity() {
        assert_eq!(severity_for(ErrorType::Storage, "quota exceeded"), Severity::Critical);
        assert_eq!(severity_for(ErrorType::Storage, "read failed"), Severity::High);
        assert_eq!(severity_for(ErrorType::Network, "timed out"), Severity::High);
        assert_eq!(severity_for(ErrorType::Network, "offline"), Severity::Medium);
        assert_eq!(severity_for(ErrorType::Api, "HTTP 401"), Severity::High);
        assert_eq!(severity_for(ErrorType::Cache, "miss"), Severity::Low);
        assert_eq!(severity_for(ErrorType::Unknown, "panic: index out of bounds"), Severity::Critical);
    }

    #[test]
    fn test_default_chains() {
        let network = default_strategies(ErrorType::Network);
        assert_eq!(network[0], RecoveryStrategy::new(RecoveryAction::Retry, 3, 1000));
        assert_eq!(network[1].action, RecoveryAction::FallbackToCache);

        let sync = default_strategies(ErrorType::Sync);
        assert_eq!(sync.last().unwrap().action, RecoveryAction::Manual);

        assert_eq!(default_strategies(ErrorType::Validation).len(), 1);
    }
}
