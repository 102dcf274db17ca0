// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two consumers share one [`RetryConfig`] shape:
//! - storage backends wrap individual queries with [`retry`] / [`retry_when`];
//! - the offline queue spaces out replays of a failed operation with
//!   [`RetryConfig::jittered_delay`], one drain cycle per attempt.
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Queue replay: jitter keeps reconnect storms spread out
//! let queue = RetryConfig::queue();
//! let delay = queue.jittered_delay(3, 0.0);
//! assert_eq!(delay, Duration::from_secs(4)); // 1s * 2^3 * 0.5
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for opening backends
/// - [`RetryConfig::query()`] - Quick retry for individual storage calls
/// - [`RetryConfig::queue()`] - Replay spacing for queued operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::queue()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening a backend.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Replay spacing for queued operations: 1s base, 30s cap, 3 retries.
    #[must_use]
    pub fn queue() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Un-jittered delay before retry number `retry_count`:
    /// `initial * factor^retry_count`, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let exp = self.factor.powi(retry_count.min(63) as i32);
        let millis = self.initial_delay.as_millis() as f64 * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// `initial * factor^retry_count * (0.5 + jitter * 0.5)`, capped at
    /// `max_delay`. `jitter` is clamped into `[0, 1]`.
    #[must_use]
    pub fn jittered_delay(&self, retry_count: u32, jitter: f64) -> Duration {
        let exp = self.factor.powi(retry_count.min(63) as i32);
        let scale = 0.5 + jitter.clamp(0.0, 1.0) * 0.5;
        let millis = self.initial_delay.as_millis() as f64 * exp * scale;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// [`jittered_delay`](Self::jittered_delay) with a random jitter.
    #[must_use]
    pub fn random_delay(&self, retry_count: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.jittered_delay(retry_count, jitter)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation_name, config, operation, |_| true).await
}

/// Like [`retry`], but gives up immediately on errors `should_retry` rejects.
pub async fn retry_when<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    return Err(err);
                }

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        ).await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_when_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry_when(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("quota".to_string()))
                }
            },
            |e| e.0 != "quota",
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::query().max_retries, Some(3));

        let queue = RetryConfig::queue();
        assert_eq!(queue.initial_delay, Duration::from_secs(1));
        assert_eq!(queue.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_base_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_retries: Some(5),
        };

        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(2), Duration::from_millis(400));
        assert_eq!(config.base_delay(20), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let config = RetryConfig::queue();

        // retry 2: 1s * 4 = 4s, jitter scales into [2s, 4s]
        assert_eq!(config.jittered_delay(2, 0.0), Duration::from_secs(2));
        assert_eq!(config.jittered_delay(2, 1.0), Duration::from_secs(4));
        assert_eq!(config.jittered_delay(2, 0.5), Duration::from_secs(3));

        for _ in 0..100 {
            let d = config.random_delay(2);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_jittered_delay_caps_at_max() {
        let config = RetryConfig::queue();
        assert_eq!(config.jittered_delay(10, 1.0), Duration::from_secs(30));
        assert_eq!(config.jittered_delay(63, 0.0), Duration::from_secs(30));
    }
}
