//! Viewer frontend: static directory, dev-server reverse proxy, or the
//! embedded page. Mounted as the router fallback so `/events/` and
//! `/health` always win.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use logproxy_core::config::FrontendTarget;
use logproxy_core::LogproxyError;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, warn};

use crate::http::error::ApiError;

/// Headers that must not cross the proxy (hop-by-hop, or rewritten by it).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn should_forward_header(name: &str) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| should_forward_header(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Install the frontend for `target` as the fallback of `router`.
pub fn attach(router: Router, target: &FrontendTarget) -> Router {
    match target {
        FrontendTarget::Directory(dir) => {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "frontend directory does not exist, requests will 404");
            }
            // Unknown paths get index.html so client-side routes resolve.
            let serve_dir = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
            router.fallback_service(serve_dir)
        }
        FrontendTarget::Proxy(base) => {
            let proxy = Arc::new(DevServerProxy::new(base.clone()));
            router.fallback(move |req: Request| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.forward(req).await }
            })
        }
        FrontendTarget::Embedded => router.fallback(crate::http::ui::ui_handler),
    }
}

/// Request bodies above this are rejected rather than buffered.
const MAX_PROXY_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Forwards every request to a single upstream. Request bodies are
/// buffered; response bodies are streamed.
pub struct DevServerProxy {
    client: reqwest::Client,
    base: String,
}

impl DevServerProxy {
    pub fn new(base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn upstream_url(&self, req: &Request) -> String {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base, path)
    }

    pub async fn forward(&self, req: Request) -> Response {
        let url = self.upstream_url(&req);
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, %url, "proxying frontend request");

        let body = match axum::body::to_bytes(body, MAX_PROXY_REQUEST_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%url, error = %e, "rejecting oversized frontend request body");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(forwardable(&parts.headers))
            .body(body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(resp) => resp,
            Err(e) => {
                warn!(%url, error = %e, "frontend upstream unreachable");
                return ApiError(LogproxyError::Upstream(e.to_string())).into_response();
            }
        };

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(forwardable(upstream.headers()));
        }
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
