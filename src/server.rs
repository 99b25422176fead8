//! HTTP API.
//!
//! Two surfaces share one router builder:
//!
//! - [`ApiVariant::Old`](crate::config::ApiVariant::Old): strict gesture echo
//! - [`ApiVariant::New`](crate::config::ApiVariant::New): lenient gesture
//!   echo, single-shot generation, SSE frame streaming and the `/images`
//!   static mount
//!
//! Errors use the `{"detail": "..."}` body shape throughout.

mod handlers;
mod router;
mod types;

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub use router::{AppState, Backend, RouterBuilder};
pub use types::*;

/// Detail for `/api/generate` when the feature toggle is off.
pub const GENERATE_DISABLED: &str =
    "Image generation feature is not enabled. Set FEATURE2_ENABLED=true to enable.";

/// Detail for `/api/generate-stream` when the feature toggle is off.
pub const STREAM_DISABLED: &str = "Image generation feature is not enabled.";

/// A failed request: status code plus `detail` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), detail = %self.detail, "request failed");
        } else {
            tracing::warn!(status = self.status.as_u16(), detail = %self.detail, "request rejected");
        }
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}
