use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use logproxy_core::config::{FrontendTarget, LogproxyConfig};
use logproxy_pipeline::Broadcaster;
use std::sync::Arc;

use crate::http::frontend;

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub config: LogproxyConfig,
    pub broadcaster: Arc<Broadcaster>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: LogproxyConfig, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            config,
            broadcaster,
            started_at: Utc::now(),
        }
    }
}

/// Routes owned by the streaming core. Mergeable next to any frontend.
pub fn events_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(crate::http::events::events_handler))
        .route("/events/", get(crate::http::events::events_handler))
        .with_state(state)
}

/// Assemble the full Axum router: event stream, health probe, and the
/// configured frontend as fallback for every other path.
pub fn build_router(state: Arc<AppState>) -> Router {
    let target = state.config.frontend_target();
    let api = events_router(state.clone()).merge(
        Router::new()
            .route("/health", get(crate::http::health::health_handler))
            .with_state(state),
    );

    frontend::attach(api, &target).layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Short label for logs and `/health`.
pub fn frontend_kind(target: &FrontendTarget) -> &'static str {
    match target {
        FrontendTarget::Directory(_) => "directory",
        FrontendTarget::Proxy(_) => "proxy",
        FrontendTarget::Embedded => "embedded",
    }
}
