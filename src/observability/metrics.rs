//! Lifecycle metrics.
//!
//! Recorded through the `metrics` facade. The library installs no exporter:
//! a fixed exporter port would be contended by two generations during a
//! handoff, so the host decides whether and where to expose them.
//!
//! # Metrics
//! - `graceful_connections_accepted_total` (counter)
//! - `graceful_connections_active` (gauge)
//! - `graceful_shutdowns_total` (counter): by `outcome` (`clean`, `timeout`)
//! - `graceful_handoffs_total` (counter): by `outcome` (`spawned`, `descriptor_error`, `spawn_error`)
//! - `graceful_hook_failures_total` (counter): by `point`

use metrics::{counter, gauge};

pub fn connection_opened() {
    counter!("graceful_connections_accepted_total").increment(1);
    gauge!("graceful_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("graceful_connections_active").decrement(1.0);
}

pub fn record_shutdown(outcome: &'static str) {
    counter!("graceful_shutdowns_total", "outcome" => outcome).increment(1);
}

pub fn record_handoff(outcome: &'static str) {
    counter!("graceful_handoffs_total", "outcome" => outcome).increment(1);
}

pub fn record_hook_failure(point: &'static str) {
    counter!("graceful_hook_failures_total", "point" => point).increment(1);
}
