//! Shutdown coordination for a generation's connections.
//!
//! A [`Shutdown`] hands out two tokens and a task tracker:
//! - the stop token tells the accept loop to stop and every open connection
//!   to finish its in-flight request and close;
//! - the force token tells connections still open at the deadline to drop
//!   their sockets immediately.
//!
//! [`Shutdown::drain`] drives both, bounded by the grace period.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::GracefulError;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::observability::metrics;

/// Coordinator for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    stop_accepting: CancellationToken,
    force_close: CancellationToken,
    connections: TaskTracker,
    tracker: ConnectionTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the generation stops accepting.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Token cancelled when the grace period runs out.
    pub fn force_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    /// Count a new connection.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.tracker.track()
    }

    /// Spawn a connection task the drain will wait for.
    pub fn spawn_connection<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.connections.spawn(task);
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_accepting.is_cancelled()
    }

    /// Signal the accept loop and connections to wind down.
    pub fn trigger(&self) {
        self.stop_accepting.cancel();
    }

    /// Stop accepting and wait for open connections, at most `grace`.
    ///
    /// Connections still open at the deadline are terminated and
    /// [`GracefulError::ShutdownTimeout`] is returned.
    pub async fn drain(&self, grace: Duration) -> Result<(), GracefulError> {
        let started = Instant::now();
        self.trigger();
        self.connections.close();

        tracing::info!(
            active_connections = self.active_connections(),
            grace_ms = grace.as_millis() as u64,
            "Draining connections"
        );

        if tokio::time::timeout(grace, self.connections.wait()).await.is_ok() {
            metrics::record_shutdown("clean");
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "All connections drained cleanly"
            );
            return Ok(());
        }

        let remaining = self.active_connections();
        tracing::warn!(
            remaining_connections = remaining,
            grace_ms = grace.as_millis() as u64,
            "Grace period expired, terminating remaining connections"
        );
        self.force_close.cancel();
        self.connections.wait().await;
        metrics::record_shutdown("timeout");

        Err(GracefulError::ShutdownTimeout { grace, remaining })
    }
}
