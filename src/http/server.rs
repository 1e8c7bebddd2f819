//! HTTP serving engine.
//!
//! # Responsibilities
//! - Wrap the host's Axum router with request tracing
//! - Run the accept loop on its own task
//! - Serve each connection (HTTP/1.1 and HTTP/2) on its own task
//! - React to the shutdown tokens: finish in-flight requests, or drop the
//!   connection when the grace period has run out
//! - Report unrecoverable accept errors over a one-shot channel

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::error::GracefulError;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionGuard;

const ACCEPT_BACKOFF_BASE_MS: u64 = 10;
const ACCEPT_BACKOFF_MAX_MS: u64 = 1_000;

/// The serving engine for one generation: an address to bind on a fresh
/// start and the router requests are dispatched to.
#[derive(Debug, Clone)]
pub struct HttpServer {
    bind_address: String,
    router: Router,
}

impl HttpServer {
    /// Create a server for `router`, bound to `bind_address` on a fresh start.
    pub fn new(bind_address: impl Into<String>, router: Router) -> Self {
        Self {
            bind_address: bind_address.into(),
            router: router.layer(TraceLayer::new_for_http()),
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Start the accept loop on `listener`.
    pub fn start(self, listener: Arc<TcpListener>) -> RunningServer {
        let shutdown = Shutdown::new();
        let (error_tx, error_rx) = oneshot::channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.router,
            shutdown.clone(),
            error_tx,
        ));

        RunningServer {
            shutdown,
            accept_task: Some(accept_task),
            errors: Some(error_rx),
        }
    }
}

/// A server whose accept loop is running.
#[derive(Debug)]
pub struct RunningServer {
    shutdown: Shutdown,
    accept_task: Option<JoinHandle<()>>,
    errors: Option<oneshot::Receiver<std::io::Error>>,
}

impl RunningServer {
    pub fn active_connections(&self) -> u64 {
        self.shutdown.active_connections()
    }

    /// Wait for the accept loop to report an unrecoverable error.
    ///
    /// Never completes if the loop ends without one. Cancel safe.
    pub async fn serve_error(&mut self) -> std::io::Error {
        let Some(errors) = self.errors.as_mut() else {
            return std::future::pending().await;
        };
        let received = errors.await;
        self.errors = None;
        match received {
            Ok(err) => err,
            Err(_) => std::future::pending().await,
        }
    }

    /// Stop accepting and drain open connections within `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(), GracefulError> {
        self.shutdown.trigger();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept loop task ended abnormally");
            }
        }
        self.shutdown.drain(grace).await
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    router: Router,
    shutdown: Shutdown,
    errors: oneshot::Sender<std::io::Error>,
) {
    let stop = shutdown.stop_token();
    let mut consecutive_failures = 0u32;

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                consecutive_failures = 0;
                let guard = shutdown.connection_guard();
                tracing::debug!(
                    connection_id = %guard.id(),
                    peer_addr = %peer_addr,
                    "Connection accepted"
                );
                shutdown.spawn_connection(serve_connection(
                    stream,
                    peer_addr,
                    router.clone(),
                    guard,
                    shutdown.clone(),
                ));
            }
            Err(e) if is_transient_accept_error(&e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = accept_backoff(consecutive_failures);
                tracing::warn!(
                    error = %e,
                    attempt = consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    "Accept failed, retrying"
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept loop failed");
                let _ = errors.send(e);
                return;
            }
        }
    }

    tracing::debug!("Accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    guard: ConnectionGuard,
    shutdown: Shutdown,
) {
    let stop = shutdown.stop_token();
    let force = shutdown.force_token();

    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer_addr));
        router.clone().call(request)
    });

    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %guard.id(), error = %e, "Connection error");
                }
                break;
            }
            _ = stop.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = force.cancelled() => {
                tracing::warn!(
                    connection_id = %guard.id(),
                    peer_addr = %peer_addr,
                    "Terminating connection at grace deadline"
                );
                break;
            }
        }
    }
}

/// Errors that concern a single pending connection or a temporary resource
/// shortage rather than the listening socket itself.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}

/// Exponential backoff with up to 10% jitter for repeated accept failures.
fn accept_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_ms = ACCEPT_BACKOFF_BASE_MS
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX_MS);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter)
}
