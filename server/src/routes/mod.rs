//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. The session stream
//! WebSockets live in [`crate::ws`].

pub mod health;
pub mod spaces;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the full API router.
///
/// | Method | Path                                      | Description              |
/// |--------|-------------------------------------------|--------------------------|
/// | GET    | `/api/health`                             | Liveness probe           |
/// | POST   | `/api/spaces`                             | Submit a source bundle   |
/// | GET    | `/api/spaces/{id}/{stdin,stdout,stderr,portchan}` | Session stream (WS) |
pub fn router(state: AppState) -> Router {
    let max_bundle = state.config.server.max_bundle_size;
    Router::new()
        .route("/api/health", get(health::health))
        .route(
            "/api/spaces",
            post(spaces::submit).layer(DefaultBodyLimit::max(max_bundle)),
        )
        .route("/api/spaces/{id}/{stream}", get(crate::ws::attach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
