//! Submitting source bundles.
//!
//! - `POST /api/spaces` — body is a source bundle (zip). On success the
//!   response body is the bare session id; on failure it is the literal error
//!   text and no session exists.
//!
//! | Outcome                     | Status |
//! |-----------------------------|--------|
//! | started                     | 200    |
//! | bad bundle / command        | 400    |
//! | compiler rejected the code  | 422    |
//! | session limit reached       | 503    |
//! | build timed out             | 504    |
//! | program failed to start     | 500    |

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode};
use tracing::{info, warn};

use crate::runner::start_process;
use crate::AppState;

/// `POST /api/spaces` — build the bundle, start the program, return its
/// session id.
pub async fn submit(State(state): State<AppState>, body: Bytes) -> Result<String, (StatusCode, String)> {
    let max = state.config.server.max_sessions;
    if state.registry.session_count().await >= max {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("session limit reached (max {max})"),
        ));
    }

    info!("Submit: {} byte bundle", body.len());
    let artifact = state.builder.build(body.to_vec()).await.map_err(|e| {
        warn!("Submit rejected: {e}");
        (e.status(), e.to_string())
    })?;

    let session = state
        .registry
        .create()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    match start_process(
        state.registry.clone(),
        Arc::clone(&session),
        artifact,
        state.run_options(),
    )
    .await
    {
        Ok(_) => Ok(session.id.clone()),
        Err(e) => {
            warn!("Session {} failed to start: {e}", session.id);
            state.registry.teardown(&session, "start failed").await;
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
