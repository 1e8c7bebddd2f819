//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Process start
//!     → listener.rs (marker absent: bind; marker present: adopt fd 3)
//!     → ListenerHandle shared with the accept loop and the handoff path
//!
//! Accepted TCP connection
//!     → connection.rs (ID, open-connection count)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Acquisition happens once per generation and failures are fatal
//! - The socket outlives the accept loop so a handoff can still duplicate it
//! - Each connection is counted so a drain can report leftovers

pub mod connection;
pub mod listener;

pub use listener::{ListenerError, ListenerHandle, ListenerOrigin};
