//! Demo host for graceful-handoff.
//!
//! Serves a few routes that make handoffs observable from the outside:
//!
//! ```text
//!   GET /            greeting naming the serving process
//!   GET /pid         {"pid": ..., "generation": "fresh" | "inherited"}
//!   GET /slow?ms=N   responds after N milliseconds
//! ```
//!
//! `kill -USR2 <pid>` starts a new generation on the same socket;
//! `kill -TERM <pid>` drains and exits.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use graceful_handoff::config::{load_config, HandoffConfig};
use graceful_handoff::config::validation::validate_config;
use graceful_handoff::net::listener::generation_marker_present;
use graceful_handoff::observability::logging::init_logging;
use graceful_handoff::{Exit, Graceful, HttpServer};

#[derive(Parser, Debug)]
#[command(name = "graceful-handoff")]
#[command(about = "HTTP server that restarts without dropping connections", long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind on a fresh start. Overrides the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Grace period for in-flight requests. Overrides the config file.
    #[arg(long)]
    grace_period_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PidResponse {
    pid: u32,
    generation: &'static str,
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    #[serde(default)]
    ms: u64,
}

fn generation_label() -> &'static str {
    if generation_marker_present() {
        "inherited"
    } else {
        "fresh"
    }
}

fn demo_router() -> Router {
    Router::new()
        .route(
            "/",
            get(|| async { format!("Hello from pid {}\n", std::process::id()) }),
        )
        .route(
            "/pid",
            get(|| async {
                Json(PidResponse {
                    pid: std::process::id(),
                    generation: generation_label(),
                })
            }),
        )
        .route(
            "/slow",
            get(|Query(params): Query<SlowParams>| async move {
                tokio::time::sleep(Duration::from_millis(params.ms)).await;
                format!("done after {}ms\n", params.ms)
            }),
        )
}

fn load(args: &Args) -> Result<HandoffConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => HandoffConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.listener.bind_address = bind.clone();
    }
    if let Some(grace) = args.grace_period_ms {
        config.lifecycle.grace_period_ms = grace;
    }

    if let Err(errors) = validate_config(&config) {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(format!("invalid configuration: {}", joined.join(", ")).into());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load(&args)?;
    init_logging(&config.observability)?;

    let pid = std::process::id();
    let span = tracing::info_span!("generation", pid, origin = generation_label());

    async move {
        tracing::info!(
            bind_address = %config.listener.bind_address,
            grace_period_ms = config.lifecycle.grace_period_ms,
            reload_signal = config.lifecycle.reload_signal.name(),
            "graceful-handoff starting"
        );

        if let Some(path) = &config.lifecycle.pid_file {
            std::fs::write(path, format!("{pid}\n"))?;
        }

        let mut graceful = Graceful::with_config(config.lifecycle.clone());
        graceful
            .add_before_stop_hook(|| tracing::info!("Stopping: no longer accepting connections"))
            .add_after_stop_hook(|| tracing::info!("Stopped"))
            .add_before_reload_hook(|| tracing::info!("Reloading: starting next generation"))
            .add_after_reload_hook(|| tracing::info!("Reloaded: next generation owns the socket"));

        let server = HttpServer::new(config.listener.bind_address.clone(), demo_router());
        let exit = graceful.run_server(server).await?;

        match exit {
            Exit::Stopped => {
                if let Some(path) = &config.lifecycle.pid_file {
                    if let Err(e) = std::fs::remove_file(path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file");
                    }
                }
                tracing::info!("Shutdown complete");
            }
            Exit::Reloaded { child_pid } => {
                tracing::info!(child_pid, "Handed over to next generation");
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .instrument(span)
    .await
}
