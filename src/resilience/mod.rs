//! Retry with exponential backoff and jitter.

pub mod retry;
