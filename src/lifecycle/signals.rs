//! OS signal handling.
//!
//! # Responsibilities
//! - Subscribe to SIGINT, SIGTERM and the configured reload signal
//! - Absorb the other common control signals (SIGHUP, SIGUSR1, SIGQUIT) so
//!   they neither kill the process nor trigger anything
//! - Translate deliveries into [`Control`] commands for the dispatcher
//!
//! # Design Decisions
//! - The subscription is a value owned by the dispatcher, dropped through
//!   [`SignalSubscription::unsubscribe`] when a terminal transition begins
//! - Uses Tokio's signal handling (async-safe)

use std::future::poll_fn;
use std::task::Poll;

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::config::ReloadSignal;

/// A command for the dispatcher, from a signal or a [`crate::GracefulHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Drain and exit.
    Stop,
    /// Hand the listener to a new process, then drain and exit.
    Reload,
}

/// Live subscription to the process signals the dispatcher cares about.
#[derive(Debug)]
pub struct SignalSubscription {
    interrupt: Signal,
    terminate: Signal,
    reload: Signal,
    reload_name: &'static str,
    absorbed: Vec<(&'static str, Signal)>,
}

impl SignalSubscription {
    /// Install handlers. Must be called from within a Tokio runtime.
    pub fn subscribe(reload_signal: ReloadSignal) -> std::io::Result<Self> {
        let absorbed = [
            ("SIGHUP", SignalKind::hangup()),
            ("SIGUSR1", SignalKind::user_defined1()),
            ("SIGQUIT", SignalKind::quit()),
        ]
        .into_iter()
        .filter(|(name, _)| *name != reload_signal.name())
        .map(|(name, kind)| signal(kind).map(|s| (name, s)))
        .collect::<std::io::Result<Vec<_>>>()?;

        let subscription = Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            reload: signal(reload_signal.kind())?,
            reload_name: reload_signal.name(),
            absorbed,
        };

        tracing::debug!(
            reload_signal = subscription.reload_name,
            absorbed = ?subscription.absorbed.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            "Subscribed to process signals"
        );
        Ok(subscription)
    }

    /// Wait for the next signal that maps to a [`Control`].
    ///
    /// Absorbed signals are logged and discarded.
    pub async fn recv(&mut self) -> Control {
        loop {
            tokio::select! {
                Some(()) = self.interrupt.recv() => {
                    tracing::info!(signal = "SIGINT", "Received stop signal");
                    return Control::Stop;
                }
                Some(()) = self.terminate.recv() => {
                    tracing::info!(signal = "SIGTERM", "Received stop signal");
                    return Control::Stop;
                }
                Some(()) = self.reload.recv() => {
                    tracing::info!(signal = self.reload_name, "Received reload signal");
                    return Control::Reload;
                }
                name = next_absorbed(&mut self.absorbed) => {
                    tracing::debug!(signal = name, "Ignoring signal");
                }
            }
        }
    }

    /// Stop reacting to signals.
    ///
    /// Tokio keeps its process-wide handler installed, so later deliveries of
    /// these signals are swallowed rather than restored to their defaults.
    pub fn unsubscribe(self) {
        tracing::debug!("Unsubscribed from process signals");
    }
}

async fn next_absorbed(absorbed: &mut [(&'static str, Signal)]) -> &'static str {
    poll_fn(|cx| {
        for (name, signal) in absorbed.iter_mut() {
            if let Poll::Ready(Some(())) = signal.poll_recv(cx) {
                return Poll::Ready(*name);
            }
        }
        Poll::Pending
    })
    .await
}
