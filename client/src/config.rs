//! Configuration loading for farm.
//!
//! Each setting is resolved from the first source that provides it:
//!
//! 1. **CLI flags** — `--server`, `--bind-host`
//! 2. **Environment** — `DEVFARM_SERVER`
//! 3. **JSON file** — via `--config <path>` or `DEVFARM_CONFIG`
//! 4. **Defaults** — server `http://127.0.0.1:8080`, bind host `0.0.0.0`,
//!    upstream host taken from the server URL
//!
//! ```json
//! {
//!   "server": "http://farm.local:8080",
//!   "bind_host": "127.0.0.1",
//!   "upstream_host": "10.0.0.5"
//! }
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// CLI arguments parsed by `clap`.
#[derive(Parser, Debug)]
#[command(
    name = "farm",
    version,
    about = "Build a package on a devfarm server, run it there and tunnel its ports here",
    after_help = "Options go before <COMMAND>; everything after it is passed through as build flags, \
                  the last word being the package directory."
)]
pub struct Cli {
    /// Server base URL (default http://127.0.0.1:8080)
    #[arg(long)]
    pub server: Option<String>,

    /// Path to a JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory shipped as the program's working directory
    #[arg(long)]
    pub resources: Option<PathBuf>,

    /// Local address tunnel listeners bind to (default 0.0.0.0)
    #[arg(long)]
    pub bind_host: Option<String>,

    /// `build` or `install`
    pub command: String,

    /// Build flags followed by the package directory
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "FLAGS.. PACKAGE"
    )]
    pub args: Vec<String>,
}

impl Cli {
    /// Split the trailing words into build flags and the package.
    pub fn flags_and_package(&self) -> (&[String], &str) {
        match self.args.split_last() {
            Some((package, flags)) => (flags, package.as_str()),
            None => (&[], "."),
        }
    }
}

/// Raw JSON config file structure.
#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub bind_host: Option<String>,
    /// Host tunnelled connections are dialled on; defaults to the server host.
    pub upstream_host: Option<String>,
}

/// Settings ready for use.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub server_url: String,
    pub bind_host: String,
    /// `None` means "the host of `server_url`".
    pub upstream_host: Option<String>,
}

/// Load configuration from CLI args, env vars and the optional config file.
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, String> {
    resolve(cli, |key| std::env::var(key).ok())
}

fn resolve(cli: &Cli, var: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig, String> {
    let file_path = cli
        .config
        .clone()
        .or_else(|| var("DEVFARM_CONFIG").map(PathBuf::from));
    let file = match file_path {
        Some(path) => load_from_file(&expand_tilde(&path))?,
        None => FileConfig::default(),
    };

    let server_url = cli
        .server
        .clone()
        .or_else(|| var("DEVFARM_SERVER"))
        .or(file.server)
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    if server_url.trim().is_empty() {
        return Err("server URL is empty".into());
    }

    Ok(ResolvedConfig {
        server_url,
        bind_host: cli
            .bind_host
            .clone()
            .or(file.bind_host)
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
        upstream_host: file.upstream_host,
    })
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn load_from_file(path: &Path) -> Result<FileConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
}
