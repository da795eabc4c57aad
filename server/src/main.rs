#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # devfarm
//!
//! Remote build-and-run server.
//!
//! A client submits a source bundle; devfarm compiles it, starts the program
//! in a scratch directory and exposes its stdin, stdout and stderr as
//! WebSockets, plus a `portchan` socket announcing the TCP ports the program
//! listens on so the client can tunnel them.
//!
//! ## API surface
//!
//! | Method | Path                         | Description                        |
//! |--------|------------------------------|------------------------------------|
//! | GET    | `/api/health`                | Liveness probe                     |
//! | POST   | `/api/spaces`                | Submit bundle, returns session id  |
//! | GET    | `/api/spaces/{id}/stdin`     | WebSocket, client → program        |
//! | GET    | `/api/spaces/{id}/stdout`    | WebSocket, program → client        |
//! | GET    | `/api/spaces/{id}/stderr`    | WebSocket, program → client        |
//! | GET    | `/api/spaces/{id}/portchan`  | WebSocket, listening-port snapshots|
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap CLI, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! routes/
//!   health.rs      — GET /api/health
//!   spaces.rs      — POST /api/spaces
//! ws/
//!   mod.rs         — per-stream WebSocket endpoints, UTF-8 framing
//! sessions/
//!   pipe.rs        — rendezvous StreamPipe with backpressure
//!   session.rs     — Session (four pipes + cancel token)
//!   mod.rs         — SessionRegistry
//! build/           — Builder trait, cargo-backed ToolchainBuilder
//! runner/
//!   process.rs     — start_process(), stdio bridges, exit watcher
//!   probe.rs       — listening-port discovery
//! bundle.rs        — zip codec for bundles and artifacts
//! stream.rs        — ByteSource / ByteSink and the pump copy loop
//! ```

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use devfarm::{router, AppState, Config};

/// Remote build-and-run server.
#[derive(Parser, Debug)]
#[command(name = "devfarm", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_server(cli.config.as_deref()).await
}

async fn run_server(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("devfarm v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        "Toolchain: {}, max sessions: {}, port probe: {}",
        config.build.toolchain,
        config.server.max_sessions,
        if config.probe.enabled { "on" } else { "off" }
    );

    let state = AppState::new(config);
    if state.config.probe.enabled && state.scanner.is_none() {
        info!("Port discovery is not supported on this platform");
    }

    let app = router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.server.listen))?;

    info!("Server ready");

    // Sessions are torn down as soon as the signal arrives so their open
    // WebSockets end and the graceful shutdown can complete.
    let registry = state.registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down...");
            registry.close_all().await;
        })
        .await
        .context("Server error")?;

    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_is_the_only_argument() {
        let cli = Cli::try_parse_from(["devfarm", "--config", "farm.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("farm.toml"));
        assert!(Cli::try_parse_from(["devfarm"]).unwrap().config.is_none());
        assert!(Cli::try_parse_from(["devfarm", "serve"]).is_err());
    }
}
