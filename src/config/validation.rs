//! Configuration validation.
//!
//! Serde handles syntax; this module checks values. All problems are
//! collected rather than stopping at the first one.

use std::fmt;

use crate::config::schema::HandoffConfig;
use crate::net::listener::normalize_bind_address;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &HandoffConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = normalize_bind_address(&config.listener.bind_address) {
        errors.push(ValidationError {
            field: "listener.bind_address",
            message: e.to_string(),
        });
    }

    if config.lifecycle.grace_period_ms == 0 {
        errors.push(ValidationError {
            field: "lifecycle.grace_period_ms",
            message: "must be greater than zero".to_string(),
        });
    }

    if config.observability.log_filter.trim().is_empty() {
        errors.push(ValidationError {
            field: "observability.log_filter",
            message: "must not be empty".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&HandoffConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = HandoffConfig::default();
        config.listener.bind_address = "8081".to_string();
        config.lifecycle.grace_period_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["listener.bind_address", "lifecycle.grace_period_ms"]);
    }

    #[test]
    fn test_accepts_port_only_and_hostname_addresses() {
        for address in [":8081", "localhost:8080", "0.0.0.0:80"] {
            let mut config = HandoffConfig::default();
            config.listener.bind_address = address.to_string();
            assert!(validate_config(&config).is_ok(), "{address}");
        }
    }
}
