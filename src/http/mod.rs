//! HTTP serving subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerHandle (shared TcpListener)
//!     → server.rs accept loop (own task, stop token, error channel)
//!     → one task per connection (hyper auto: HTTP/1.1 or HTTP/2)
//!     → host Router (with TraceLayer and ConnectInfo)
//! ```
//!
//! # Design Decisions
//! - The router is opaque: any Axum router can be served
//! - Connection tasks are tracked so a drain knows when it is done
//! - Only errors on the listening socket end the accept loop

pub mod server;

pub use server::{HttpServer, RunningServer};
