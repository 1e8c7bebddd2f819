//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → HandoffConfig (validated, immutable)
//!     → lifecycle section handed to Graceful, listener section to HttpServer
//! ```
//!
//! # Design Decisions
//! - Config is read once per generation; a handoff re-reads it in the child
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    HandoffConfig, HookFailurePolicy, LifecycleConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ReloadSignal,
};
