//! Error taxonomy for the graceful lifecycle.
//!
//! Every failure the dispatcher can observe is a [`GracefulError`]. The type
//! is `Clone` so the same value can be returned to the caller and kept in the
//! last-error slot of [`crate::Graceful`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::net::listener::ListenerError;

/// Errors produced while starting, stopping or handing off a generation.
#[derive(Debug, Clone, Error)]
pub enum GracefulError {
    /// The listener could not be bound or adopted. Fatal at startup.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// The grace period expired and remaining connections were terminated.
    #[error("grace period of {grace:?} expired with {remaining} connection(s) still open")]
    ShutdownTimeout { grace: Duration, remaining: u64 },

    /// The listening socket's descriptor could not be duplicated for handoff.
    #[error("failed to extract listener descriptor: {0}")]
    Descriptor(#[source] Arc<io::Error>),

    /// The replacement process could not be started.
    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] Arc<io::Error>),

    /// The accept loop hit an error it cannot recover from.
    #[error("accept loop failed: {0}")]
    Serve(#[source] Arc<io::Error>),

    /// Signal handlers could not be installed.
    #[error("failed to subscribe to process signals: {0}")]
    Signal(#[source] Arc<io::Error>),

    #[error("server has already been started")]
    AlreadyStarted,

    #[error("server is already stopping or reloading")]
    AlreadyTerminating,

    #[error("server is not serving")]
    NotServing,
}

impl GracefulError {
    /// Whether this error belongs in the last-error slot.
    ///
    /// API misuse (`AlreadyStarted`, `AlreadyTerminating`, `NotServing`) is
    /// reported to the caller but never recorded.
    pub fn is_recordable(&self) -> bool {
        !matches!(
            self,
            GracefulError::AlreadyStarted
                | GracefulError::AlreadyTerminating
                | GracefulError::NotServing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_remaining_connections() {
        let err = GracefulError::ShutdownTimeout {
            grace: Duration::from_millis(100),
            remaining: 2,
        };
        assert_eq!(
            err.to_string(),
            "grace period of 100ms expired with 2 connection(s) still open"
        );
    }

    #[test]
    fn test_misuse_is_not_recordable() {
        assert!(!GracefulError::AlreadyTerminating.is_recordable());
        assert!(!GracefulError::NotServing.is_recordable());
        let spawn = GracefulError::Spawn(Arc::new(io::Error::from(io::ErrorKind::NotFound)));
        assert!(spawn.is_recordable());
        assert!(std::error::Error::source(&spawn).is_some());
    }
}
