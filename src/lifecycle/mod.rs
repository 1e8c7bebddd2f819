//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (graceful.rs):
//!     Marker set? → adopt fd 3 : bind address → Start accept loop
//!
//! Stop (SIGINT/SIGTERM):
//!     Before-stop hooks → Stop accepting → Drain (grace period) → After-stop hooks
//!
//! Reload (SIGUSR2 by default, handoff.rs):
//!     Before-reload hooks → Spawn child with fd 3 → Drain → After-reload hooks
//! ```
//!
//! # Design Decisions
//! - Stop and reload are mutually exclusive: the first one wins
//! - Drain is bounded: connections left at the deadline are dropped
//! - The parent never waits for the child to become ready

pub mod graceful;
pub mod handoff;
pub mod hooks;
pub mod shutdown;
pub mod signals;

pub use graceful::{listen_and_serve, run_server, Exit, Graceful, GracefulHandle, Phase};
pub use handoff::{ChildSpec, ProcessSpawner, Spawner};
pub use hooks::{Hook, HookPoint, HookRegistry, HookReport};
pub use shutdown::Shutdown;
pub use signals::Control;
