// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network status monitor.
//!
//! Combines passive link events from the host with an active probe:
//!
//! | link | probe                     | status    |
//! |------|---------------------------|-----------|
//! | down | (not run)                 | `Offline` |
//! | up   | ok within timeout         | `Online`  |
//! | up   | timeout or non-success    | `Poor`    |
//! | up   | no probe configured       | `Online`  |
//!
//! The current status lives in a `watch` channel; subscribers only wake on
//! an actual transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Health path appended to the probe base URL
pub const DEFAULT_HEALTH_PATH: &str = "/health/simple";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    #[default]
    Offline,
    Poor,
}

impl NetworkStatus {
    /// Gauge value: 0 = offline, 1 = poor, 2 = online
    #[must_use]
    pub fn level(&self) -> u8 {
        match self {
            NetworkStatus::Offline => 0,
            NetworkStatus::Poor => 1,
            NetworkStatus::Online => 2,
        }
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Offline => write!(f, "offline"),
            NetworkStatus::Poor => write!(f, "poor"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("Probe returned HTTP {0}")]
    Status(u16),
    #[error("Probe request failed: {0}")]
    Request(String),
}

/// Active reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// GET against the API health endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    /// Probe `<base_url>/health/simple`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        Self::with_path(base_url, DEFAULT_HEALTH_PATH, timeout)
    }

    pub fn with_path(base_url: &str, path: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
            timeout,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

/// Probe whose answer is set by hand (tests, link-only deployments).
#[derive(Debug)]
pub struct ManualProbe {
    reachable: AtomicBool,
}

impl ManualProbe {
    #[must_use]
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProbeError::Request("unreachable".into()))
        }
    }
}

pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
    link_up: AtomicBool,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    interval: Duration,
    timeout: Duration,
    /// Consecutive probe failures
    failures: AtomicU64,
    /// Lock for probing (prevent overlapping checks)
    checking: Mutex<()>,
}

impl NetworkMonitor {
    /// Starts `Offline` with the link assumed up; the first
    /// [`check_now`](Self::check_now) sets the real status.
    pub fn new(probe: Option<Arc<dyn ConnectivityProbe>>, interval: Duration, timeout: Duration) -> Self {
        let (tx, _) = watch::channel(NetworkStatus::Offline);
        Self {
            tx,
            link_up: AtomicBool::new(true),
            probe,
            interval,
            timeout,
            failures: AtomicU64::new(0),
            checking: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Consecutive failed probes.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Host link event. Going down is immediate; coming up is confirmed by
    /// a probe.
    pub async fn set_link_up(&self, up: bool) -> NetworkStatus {
        self.link_up.store(up, Ordering::Release);
        if up {
            self.check_now().await
        } else {
            self.set(NetworkStatus::Offline);
            NetworkStatus::Offline
        }
    }

    /// Classify connectivity right now and publish the result.
    pub async fn check_now(&self) -> NetworkStatus {
        let _guard = self.checking.lock().await;

        let status = if !self.link_up.load(Ordering::Acquire) {
            NetworkStatus::Offline
        } else {
            match &self.probe {
                None => NetworkStatus::Online,
                Some(probe) => self.run_probe(probe.as_ref()).await,
            }
        };

        self.set(status);
        // A link-down that landed during the check overrides the result
        if self.link_up.load(Ordering::Acquire) {
            status
        } else {
            NetworkStatus::Offline
        }
    }

    async fn run_probe(&self, probe: &dyn ConnectivityProbe) -> NetworkStatus {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                self.failures.store(0, Ordering::Release);
                crate::metrics::record_probe("ok", started.elapsed());
                NetworkStatus::Online
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                let outcome = if matches!(e, ProbeError::Timeout(_)) { "timeout" } else { "error" };
                crate::metrics::record_probe(outcome, started.elapsed());
                debug!(error = %e, failures, "Connectivity probe failed");
                NetworkStatus::Poor
            }
        }
    }

    /// Publish `status`, or `Offline` while the host link is down.
    /// Returns true if it was a transition.
    pub fn set(&self, status: NetworkStatus) -> bool {
        let mut previous = status;
        let mut published = status;
        let changed = self.tx.send_if_modified(|current| {
            // Read under the channel lock so a concurrent link-down can't be overwritten
            published = if self.link_up.load(Ordering::Acquire) {
                status
            } else {
                NetworkStatus::Offline
            };
            if *current == published {
                false
            } else {
                previous = std::mem::replace(current, published);
                true
            }
        });

        if changed {
            crate::metrics::set_network_status(published.level());
            match published {
                NetworkStatus::Online => info!(from = %previous, "Network online"),
                NetworkStatus::Poor => warn!(from = %previous, "Network degraded"),
                NetworkStatus::Offline => warn!(from = %previous, "Network offline"),
            }
        }
        changed
    }

    /// Periodic probe loop. Exits on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Network monitor stopped");
    }
}
