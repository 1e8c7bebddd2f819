//! Listener acquisition for a generation.
//!
//! # Responsibilities
//! - Decide between a fresh bind and adopting an inherited socket
//! - Bind to the configured address on a fresh start
//! - Adopt the descriptor at [`INHERITED_FD`] when the generation marker is set
//! - Duplicate the live socket's descriptor for a handoff
//!
//! The decision is made once per process and never revisited.

use std::net::SocketAddr;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

/// Environment variable whose presence marks a handoff start.
pub const GENERATION_MARKER: &str = "GRACEFUL_HANDOFF";

/// Descriptor slot the parent places the listening socket in, right after
/// stdin, stdout and stderr.
pub const INHERITED_FD: RawFd = 3;

/// Error type for listener acquisition.
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    /// The configured address is not `host:port` or does not resolve.
    #[error("invalid bind address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Failed to build a listener from the inherited descriptor.
    #[error("failed to adopt inherited listener on fd {fd}: {source}")]
    Adopt {
        fd: RawFd,
        #[source]
        source: Arc<std::io::Error>,
    },
}

/// How the current generation obtained its listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Bound by this process.
    Fresh,
    /// Inherited from the previous generation.
    Inherited { fd: RawFd },
}

/// The acquisition path chosen for a given marker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePlan {
    Bind,
    Adopt { fd: RawFd },
}

impl AcquirePlan {
    /// Pick the path for a marker state. The two paths never mix.
    pub fn for_marker(marker_present: bool) -> Self {
        if marker_present {
            AcquirePlan::Adopt { fd: INHERITED_FD }
        } else {
            AcquirePlan::Bind
        }
    }
}

/// Whether this process was started by a handoff.
pub fn generation_marker_present() -> bool {
    std::env::var_os(GENERATION_MARKER).is_some()
}

/// A listening socket shared between the accept loop and the handoff path.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    inner: Arc<TcpListener>,
    origin: ListenerOrigin,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    fn new(listener: TcpListener, origin: ListenerOrigin) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Arc::new(listener),
            origin,
            local_addr,
        })
    }

    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listener itself, for the accept loop.
    pub fn shared(&self) -> Arc<TcpListener> {
        Arc::clone(&self.inner)
    }

    /// Duplicate the underlying descriptor.
    ///
    /// The duplicate refers to the same socket and carries `FD_CLOEXEC`; the
    /// spawner decides where it lands in the child.
    pub fn duplicate_fd(&self) -> std::io::Result<OwnedFd> {
        self.inner.as_fd().try_clone_to_owned()
    }
}

/// Acquire the listener for this generation, consulting the environment.
pub async fn acquire(bind_address: &str) -> Result<ListenerHandle, ListenerError> {
    acquire_with(AcquirePlan::for_marker(generation_marker_present()), bind_address).await
}

/// Acquire the listener following an explicit plan.
pub async fn acquire_with(
    plan: AcquirePlan,
    bind_address: &str,
) -> Result<ListenerHandle, ListenerError> {
    match plan {
        AcquirePlan::Bind => bind(bind_address).await,
        AcquirePlan::Adopt { fd } => adopt(fd),
    }
}

/// Normalize a `host:port` bind address.
///
/// An empty host (`":8080"`) means every IPv4 interface. Hostnames are
/// accepted and resolved at bind time.
pub fn normalize_bind_address(bind_address: &str) -> Result<String, ListenerError> {
    let invalid = |reason: &str| ListenerError::InvalidAddress {
        address: bind_address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = bind_address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    port.parse::<u16>().map_err(|_| invalid("port is not a number in 0-65535"))?;

    if host.is_empty() {
        Ok(format!("0.0.0.0:{}", port))
    } else {
        Ok(bind_address.to_string())
    }
}

/// Bind a fresh listening socket.
///
/// Every address the host resolves to is tried in order; the first that
/// binds wins.
pub async fn bind(bind_address: &str) -> Result<ListenerHandle, ListenerError> {
    let normalized = normalize_bind_address(bind_address)?;
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(normalized.as_str())
        .await
        .map_err(|e| ListenerError::InvalidAddress {
            address: bind_address.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let bind_error = |e: std::io::Error| ListenerError::Bind {
        address: bind_address.to_string(),
        source: Arc::new(e),
    };

    let mut last_error = None;
    for addr in candidates {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let handle =
                    ListenerHandle::new(listener, ListenerOrigin::Fresh).map_err(bind_error)?;
                tracing::info!(address = %handle.local_addr(), requested = bind_address, "Listener bound");
                return Ok(handle);
            }
            Err(e) => {
                tracing::debug!(address = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(bind_error(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )
    })))
}

/// Adopt a listening socket passed down by the previous generation.
///
/// Must be called from within a Tokio runtime.
pub fn adopt(fd: RawFd) -> Result<ListenerHandle, ListenerError> {
    let adopt_error = |e| ListenerError::Adopt {
        fd,
        source: Arc::new(e),
    };

    if !is_socket(fd) {
        return Err(adopt_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "descriptor is not an open socket",
        )));
    }

    // SAFETY: fd is an open socket handed to this process at exec time and
    // nothing else in the process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true).map_err(adopt_error)?;

    // The slot was placed without FD_CLOEXEC for the exec; keep it out of
    // any other child this process starts.
    set_cloexec(fd).map_err(adopt_error)?;

    let listener = TcpListener::from_std(std_listener).map_err(adopt_error)?;
    let handle =
        ListenerHandle::new(listener, ListenerOrigin::Inherited { fd }).map_err(adopt_error)?;

    tracing::info!(fd, address = %handle.local_addr(), "Inherited listener from parent process");
    Ok(handle)
}

fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Check with fstat that a descriptor is an open socket.
fn is_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    // SAFETY: fstat only writes into the zeroed struct we hand it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
