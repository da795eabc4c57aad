//! # farm
//!
//! Command-line client for a devfarm server. Packs a package from the local
//! workspace, has the server build and run it, and then behaves like the
//! remote program: its output appears on the terminal, the terminal's input
//! reaches it, and every TCP port it listens on is reachable locally.
//!
//! ```text
//! farm [--server URL] [--config FILE] [--resources DIR] [--bind-host HOST] \
//!      <build|install> [FLAGS..] <PACKAGE>
//! ```
//!
//! ## Architecture
//!
//! ```text
//! main.rs     — entry point, tracing setup, submit-and-run workflow
//! config.rs   — CLI definition, JSON file / env-var configuration
//! pack.rs     — source bundle packer (zip)
//! client.rs   — HTTP client for POST /api/spaces
//! session.rs  — relays the session's four WebSocket streams
//! tunnel.rs   — mirrors remote listening ports as local listeners
//! ```
//!
//! Exit status is the remote program's exit code; 1 when the submission or
//! the build fails.

mod client;
mod config;
mod pack;
mod session;
mod tunnel;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use client::{ClientError, SpaceClient};
use config::{Cli, ResolvedConfig};
use tunnel::PortTunnelManager;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout belongs to the remote program; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let resolved = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("farm: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let code = match run(&cli, resolved).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("farm: {e:#}");
            1
        }
    };
    // Exit right away: a blocked read on local stdin would otherwise hold the
    // runtime open.
    std::process::exit(code);
}

async fn run(cli: &Cli, config: ResolvedConfig) -> anyhow::Result<i32> {
    let (flags, package) = cli.flags_and_package();
    let working_dir = std::env::current_dir().context("Failed to read current directory")?;
    let (command, flags, package) = (cli.command.clone(), flags.to_vec(), package.to_string());
    let resources = cli.resources.clone();

    let bundle = tokio::task::spawn_blocking(move || {
        pack::pack(&working_dir, &command, &flags, &package, resources.as_deref())
    })
    .await
    .context("packer task failed")??;
    info!("Packed bundle ({} bytes)", bundle.len());

    let client = SpaceClient::new(&config.server_url)?;
    let id = match client.submit(bundle).await {
        Ok(id) => id,
        Err(ClientError::Server { message, .. }) => {
            eprint!("{message}");
            if !message.ends_with('\n') {
                eprintln!();
            }
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };
    info!("Session {id} started on {}", config.server_url);

    let upstream = config
        .upstream_host
        .or_else(|| client.host())
        .context("server URL has no host to tunnel to")?;
    let tunnels = Arc::new(PortTunnelManager::new(config.bind_host, upstream));

    Ok(session::run(&client, &id, tunnels).await?)
}
