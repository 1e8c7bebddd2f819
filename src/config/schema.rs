//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from a TOML file and
//! every field has a default, so an empty file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::signal::unix::SignalKind;

/// Root configuration for a process hosting a graceful listener.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Stop and reload behaviour.
    pub lifecycle: LifecycleConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address for a fresh start (e.g., "127.0.0.1:8080").
    ///
    /// Ignored by a generation started through a handoff, which adopts the
    /// inherited socket instead.
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Lifecycle configuration: grace period, signals, hooks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Time allowed for in-flight connections to finish, in milliseconds.
    pub grace_period_ms: u64,

    /// Signal that triggers a handoff to a new generation.
    pub reload_signal: ReloadSignal,

    /// Subscribe to process signals. Disable when the host drives stop and
    /// reload exclusively through a [`crate::GracefulHandle`].
    pub handle_signals: bool,

    /// What happens to the remaining hooks when one of them panics.
    pub hook_failure_policy: HookFailurePolicy,

    /// Optional file the host writes its process id into.
    pub pid_file: Option<PathBuf>,
}

impl LifecycleConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            reload_signal: ReloadSignal::default(),
            handle_signals: true,
            hook_failure_policy: HookFailurePolicy::default(),
            pid_file: None,
        }
    }
}

/// Signals that may be designated as the reload trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReloadSignal {
    /// SIGUSR2.
    #[default]
    Usr2,
    /// SIGUSR1.
    Usr1,
    /// SIGHUP.
    Hup,
}

impl ReloadSignal {
    pub fn kind(self) -> SignalKind {
        match self {
            ReloadSignal::Usr2 => SignalKind::user_defined2(),
            ReloadSignal::Usr1 => SignalKind::user_defined1(),
            ReloadSignal::Hup => SignalKind::hangup(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReloadSignal::Usr2 => "SIGUSR2",
            ReloadSignal::Usr1 => "SIGUSR1",
            ReloadSignal::Hup => "SIGHUP",
        }
    }

    /// Raw signal number, for tools that deliver the signal to a process.
    pub fn as_raw(self) -> i32 {
        match self {
            ReloadSignal::Usr2 => libc::SIGUSR2,
            ReloadSignal::Usr1 => libc::SIGUSR1,
            ReloadSignal::Hup => libc::SIGHUP,
        }
    }
}

/// Policy applied when a lifecycle hook panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HookFailurePolicy {
    /// Log the panic and run the remaining hooks.
    #[default]
    Continue,
    /// Log the panic and skip the remaining hooks at that point.
    Abort,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Output format for log lines.
    pub log_format: LogFormat,

    /// Filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "graceful_handoff=info,tower_http=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: HandoffConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8080");
        assert_eq!(config.lifecycle.grace_period(), Duration::from_secs(10));
        assert_eq!(config.lifecycle.reload_signal, ReloadSignal::Usr2);
        assert!(config.lifecycle.handle_signals);
        assert_eq!(config.lifecycle.hook_failure_policy, HookFailurePolicy::Continue);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config: HandoffConfig = toml::from_str(
            r#"
            [lifecycle]
            grace_period_ms = 250
            reload_signal = "hup"
            hook_failure_policy = "abort"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.lifecycle.grace_period(), Duration::from_millis(250));
        assert_eq!(config.lifecycle.reload_signal, ReloadSignal::Hup);
        assert_eq!(config.lifecycle.reload_signal.as_raw(), libc::SIGHUP);
        assert_eq!(config.lifecycle.hook_failure_policy, HookFailurePolicy::Abort);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.listener.bind_address, "127.0.0.1:8080");
    }
}
