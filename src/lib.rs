//! Zero-downtime restarts for HTTP servers.
//!
//! A running generation hands its listening socket to a freshly started copy
//! of itself on the reload signal, then drains its own connections and exits.

#[cfg(not(unix))]
compile_error!("graceful-handoff relies on Unix descriptor inheritance and signals");

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::HandoffConfig;
pub use error::GracefulError;
pub use http::HttpServer;
pub use lifecycle::{listen_and_serve, run_server, Exit, Graceful, GracefulHandle, HookPoint};
