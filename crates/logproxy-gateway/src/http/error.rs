//! JSON error responses for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use logproxy_core::LogproxyError;
use serde::Serialize;

/// Wraps a core error so handlers can return it with `?`.
#[derive(Debug)]
pub struct ApiError(pub LogproxyError);

impl From<LogproxyError> for ApiError {
    fn from(err: LogproxyError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    status: u16,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            LogproxyError::TooManyConsumers { .. } | LogproxyError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LogproxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
