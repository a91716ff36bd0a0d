use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced to HTTP/WS callers. Browser-side and per-frame failures
/// never reach this type — they are absorbed by the session loop and only
/// show up indirectly (via `lastError` in status, or a frame that never
/// arrives within the cold-start wait).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unknown view")]
    UnknownView,
    #[error("renderer not ready")]
    RendererNotReady,
    #[error("too many active views")]
    TooManyActiveViews {
        limit: usize,
        active_views: Vec<String>,
        requested: String,
    },
    #[error("no frame available")]
    NoFrame { view_id: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable error code, shared between HTTP JSON bodies
    /// and WS `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownView => "unknown_view",
            Self::RendererNotReady => "renderer_not_ready",
            Self::TooManyActiveViews { .. } => "too_many_active_views",
            Self::NoFrame { .. } => "no_frame",
            Self::Unauthorized => "unauthorized",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::NotFound => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownView | Self::NotFound => StatusCode::NOT_FOUND,
            Self::RendererNotReady | Self::NoFrame { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyActiveViews { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The JSON body shape shared between HTTP responses and WS `error` frames.
    pub fn body(&self) -> serde_json::Value {
        match self {
            Self::TooManyActiveViews {
                limit,
                active_views,
                requested,
            } => json!({
                "error": self.code(),
                "limit": limit,
                "activeViews": active_views,
                "requested": requested,
            }),
            Self::NoFrame { view_id } => json!({
                "error": self.code(),
                "viewId": view_id,
            }),
            _ => json!({ "error": self.code() }),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Failures from the browser-driver boundary (navigate/reload/evaluate/
/// screenshot). Recorded in a session's `lastError` and logged as a
/// warning; never propagated to subscribers directly.
#[derive(Debug, thiserror::Error, Clone)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigate(String),
    #[error("reload failed: {0}")]
    Reload(String),
    #[error("evaluate failed: {0}")]
    Evaluate(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("browser launch failed: {0}")]
    Launch(String),
}
