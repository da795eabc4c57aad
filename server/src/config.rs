//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `DEVFARM_LISTEN`, `DEVFARM_TOOLCHAIN`,
//!    `DEVFARM_LOG`
//! 2. **Config file** — path via `--config <path>`, or `devfarm.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_sessions = 32
//! max_bundle_size = 67108864  # 64 MB
//! chunk_size = 1000
//!
//! [build]
//! toolchain = "cargo"
//! timeout_secs = 600
//!
//! [probe]
//! enabled = true
//! interval_ms = 3000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently running sessions (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Largest accepted source bundle in bytes (default 64 MB).
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,
    /// Largest payload of one WebSocket message in bytes (default 1000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// How submitted bundles are compiled.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Cargo-compatible toolchain binary (default `cargo`).
    /// Override with `DEVFARM_TOOLCHAIN`.
    #[serde(default = "default_toolchain")]
    pub toolchain: String,
    /// Upper bound for one build in seconds (default 600).
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

/// Listening-port discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Disable to stop publishing port snapshots (default true).
    #[serde(default = "default_probe_enabled")]
    pub enabled: bool,
    /// Scan interval in milliseconds (default 3000).
    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_max_bundle_size() -> usize {
    64 * 1024 * 1024 // 64 MB
}
fn default_chunk_size() -> usize {
    1000
}
fn default_toolchain() -> String {
    "cargo".to_string()
}
fn default_build_timeout() -> u64 {
    600
}
fn default_probe_enabled() -> bool {
    true
}
fn default_probe_interval() -> u64 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            max_bundle_size: default_max_bundle_size(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            toolchain: default_toolchain(),
            timeout_secs: default_build_timeout(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: default_probe_enabled(),
            interval_ms: default_probe_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `devfarm.toml` in the current directory is used when present, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("devfarm.toml").exists() => Self::from_file(Path::new("devfarm.toml"))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("DEVFARM_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(toolchain) = var("DEVFARM_TOOLCHAIN") {
            self.build.toolchain = toolchain;
        }
        if let Some(level) = var("DEVFARM_LOG") {
            self.logging.level = level;
        }
    }
}
