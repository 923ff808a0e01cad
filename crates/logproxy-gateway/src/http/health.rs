use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::{frontend_kind, AppState};

/// GET /health: liveness probe with broadcaster counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.broadcaster.stats();
    Json(json!({
        "status": if state.broadcaster.is_shutting_down() { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": env!("LOGPROXY_GIT_SHA"),
        "started_at": state.started_at.to_rfc3339(),
        "frontend": frontend_kind(&state.config.frontend_target()),
        "broadcast": stats,
    }))
}
