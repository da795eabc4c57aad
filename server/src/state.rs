//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::build::{Builder, ToolchainBuilder};
use crate::config::Config;
use crate::runner::{platform_scanner, PortScanner, RunOptions};
use crate::sessions::SessionRegistry;

/// Shared application state for the devfarm server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live sessions keyed by id.
    pub registry: SessionRegistry,
    /// Turns submitted source bundles into artifacts.
    pub builder: Arc<dyn Builder>,
    /// Port discovery backend; `None` when disabled or unsupported.
    pub scanner: Option<Arc<dyn PortScanner>>,
}

impl AppState {
    /// State wired with the toolchain builder and the platform scanner.
    pub fn new(config: Config) -> Self {
        let builder = Arc::new(ToolchainBuilder::from_config(&config.build));
        let scanner = if config.probe.enabled {
            platform_scanner()
        } else {
            None
        };
        Self::with_parts(config, builder, scanner)
    }

    /// State with explicit collaborators (tests, embedding).
    pub fn with_parts(
        config: Config,
        builder: Arc<dyn Builder>,
        scanner: Option<Arc<dyn PortScanner>>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(config.server.max_sessions),
            config: Arc::new(config),
            start_time: Instant::now(),
            builder,
            scanner,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            chunk_size: self.config.server.chunk_size,
            probe_interval: self.config.probe.interval(),
            scanner: self.scanner.clone(),
        }
    }
}
