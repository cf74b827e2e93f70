//! Graceful shutdown coordination
//!
//! One `ShutdownService` per worker. Long-running tasks hand their join
//! handles to `track` and watch `signal_rx()`; when a stop is requested the
//! signal flips, tasks wind down, and `shutdown()` tears the gateway down
//! in order: background tasks, then consumers and connections, then the
//! store adapter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::gateway::ConnectionSupervisor;
use crate::store::StoreService;

/// Coordinates an orderly stop of one worker
#[derive(Clone)]
pub struct ShutdownService {
    signal: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<StoreService>,
}

impl ShutdownService {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, store: Arc<StoreService>) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            tasks: Arc::new(Mutex::new(Vec::new())),
            supervisor,
            store,
        }
    }

    /// Keep a background task's handle so teardown can wait on it
    pub async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// A receiver that flips to `true` once a stop has been requested
    pub fn signal_rx(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Flip the stop signal; running tasks notice on their next tick
    pub fn request_stop(&self) {
        let _ = self.signal.send(true);
    }

    /// Whether a stop has been requested
    pub fn stop_requested(&self) -> bool {
        *self.signal.borrow()
    }

    /// A future that resolves once a stop has been requested. Handed to the
    /// HTTP server as its graceful-shutdown trigger.
    pub fn finished(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.signal.subscribe();
        async move {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    }

    /// Run the full teardown:
    /// 1. Request a stop so the poll tick, heartbeat, and sweeps exit
    /// 2. Give tracked tasks a bounded window to finish; abort stragglers
    /// 3. Destroy consumers and close every connection (code 1001)
    /// 4. Close the store adapter so nothing can write after teardown
    pub async fn shutdown(&self) {
        self.request_stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        tracing::debug!(tasks = tasks.len(), "Stopping background tasks");

        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        for mut handle in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                tracing::warn!("Background task still running at the deadline, aborting it");
                handle.abort();
            }
        }

        tracing::debug!("Closing connections and consumers");
        self.supervisor.shutdown().await;

        self.store.close();
        tracing::debug!("Gateway stopped");
    }

    /// Wire Ctrl+C (and SIGTERM on unix) to the stop signal
    pub fn hook_signals(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupt received, stopping");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Termination requested, stopping");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Interrupt received, stopping");
            }

            service.request_stop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::gateway_fixture;

    async fn service() -> ShutdownService {
        let fx = gateway_fixture().await;
        ShutdownService::new(fx.supervisor.clone(), fx.store.clone())
    }

    #[tokio::test]
    async fn test_stop_flag_starts_clear() {
        let shutdown = service().await;
        assert!(!shutdown.stop_requested());
        assert!(!*shutdown.signal_rx().borrow());
    }

    #[tokio::test]
    async fn test_request_stop_flips_signal() {
        let shutdown = service().await;
        let rx = shutdown.signal_rx();
        shutdown.request_stop();
        assert!(shutdown.stop_requested());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_finished_resolves_once_stopped() {
        let shutdown = service().await;
        let waiter = tokio::spawn(shutdown.finished());

        tokio::task::yield_now().await;
        shutdown.request_stop();

        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("finished() should resolve after request_stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tracked_task() {
        let shutdown = service().await;
        let mut rx = shutdown.signal_rx();
        shutdown
            .track(tokio::spawn(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            }))
            .await;

        tokio::time::timeout(Duration::from_secs(1), shutdown.shutdown())
            .await
            .expect("teardown should not hang on a cooperative task");
    }

    #[tokio::test]
    async fn test_shutdown_closes_store() {
        let shutdown = service().await;
        shutdown.shutdown().await;
        assert!(shutdown.store.is_closed());
    }
}
