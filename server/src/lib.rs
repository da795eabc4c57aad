#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! devfarm library: the session runtime behind the `devfarm` server.
//!
//! - `sessions` — stream pipes, sessions and the session registry
//! - `stream` — byte source/sink traits and the copy loop bridging them
//! - `bundle` — zip codec for source bundles and artifacts
//! - `build` — the `Builder` trait and the cargo-backed implementation
//! - `runner` — process start, stdio bridging, port discovery
//! - `ws` — WebSocket transport for session streams
//! - `routes` — HTTP handlers and the router
//! - `config` — configuration loading

pub mod build;
pub mod bundle;
pub mod config;
pub mod error;
pub mod routes;
pub mod runner;
pub mod sessions;
pub mod state;
pub mod stream;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use build::{Builder, ToolchainBuilder};
pub use config::Config;
pub use routes::router;
pub use sessions::SessionRegistry;
pub use state::AppState;
