//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Lifecycle transitions, hooks, accept loop, connections:
//!     → tracing events with structured fields (logging.rs installs the subscriber)
//!     → metrics facade counters and gauges (metrics.rs)
//! ```
//!
//! # Design Decisions
//! - Each generation logs under a span carrying its process id
//! - JSON format for production, pretty format for development
//! - Metrics are cheap facade calls; exporting is left to the host

pub mod logging;
pub mod metrics;
