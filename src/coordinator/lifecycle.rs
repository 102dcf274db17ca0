//! Startup, background tasks, and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::network::NetworkStatus;
use crate::queue::OfflineQueue;

use super::{EngineError, EngineState, OfflineSync};

impl OfflineSync {
    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Restore the queue and spawn the background tasks.
    ///
    /// 1. Reload queued and failed operations from the durable store
    /// 2. Probe connectivity once
    /// 3. Spawn: probe loop, reconnect watcher, sync worker, write-back flusher
    /// 4. Drain right away if online with a non-empty queue
    #[tracing::instrument(skip(self), fields(restored, network))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(EngineError::AlreadyStarted(state));
        }
        let started = Instant::now();
        info!("Starting offline sync...");

        let restored = self.queue.restore().await?;
        tracing::Span::current().record("restored", restored as u64);

        let network = self.monitor.check_now().await;
        tracing::Span::current().record("network", tracing::field::display(network));
        self.queue.publish();

        let _ = self.shutdown_tx.send(false);
        let mut tasks = Vec::with_capacity(4);

        let monitor = self.monitor.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { monitor.run(shutdown).await }));

        let queue = self.queue.clone();
        let network_rx = self.monitor.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(watch_reconnect(queue, network_rx, shutdown)));

        let queue = self.queue.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { queue.run(shutdown).await }));

        let cache = self.cache.clone();
        let flush_interval = Duration::from_millis(self.config.write_back_flush_ms);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { cache.run_write_back(flush_interval, shutdown).await }));

        self.tasks.lock().extend(tasks);
        self.set_state(EngineState::Running);

        if network == NetworkStatus::Online && !self.queue.is_empty() {
            self.queue.trigger();
        }

        info!(
            restored,
            %network,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Offline sync running"
        );
        Ok(())
    }

    /// Stop background tasks, flush pending write-backs, and persist the
    /// queue. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        let started = Instant::now();
        info!("Initiating offline sync shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let report = self.cache.flush_write_back().await;
        if report.remaining > 0 {
            warn!(remaining = report.remaining, "Write-back entries could not be flushed");
        }

        if let Err(e) = self.queue.persist_all().await {
            warn!(error = %e, "Failed to persist operation queue at shutdown");
        }

        if let Some(durable) = &self.durable {
            durable.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!(
            pending = self.queue.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Offline sync shutdown complete"
        );
    }
}

/// Republish the queue snapshot on every network change, and kick a drain
/// when the network comes back with work queued.
async fn watch_reconnect(
    queue: Arc<OfflineQueue>,
    mut network: watch::Receiver<NetworkStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut previous = *network.borrow_and_update();

    loop {
        tokio::select! {
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *network.borrow_and_update();
                queue.publish();

                if current == NetworkStatus::Online && previous != NetworkStatus::Online && !queue.is_empty() {
                    info!(from = %previous, pending = queue.len(), "Back online, syncing queued operations");
                    queue.trigger();
                }
                previous = current;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Reconnect watcher stopped");
}
