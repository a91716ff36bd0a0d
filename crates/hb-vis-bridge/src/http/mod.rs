pub mod auth;
mod frame;
mod status;

use std::sync::Arc;

use axum::Router;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::error::BridgeError;
use crate::render::RendererPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<RendererPool>,
    pub auth_token: Option<String>,
    pub default_view: Option<String>,
}

/// Builds the full HTTP + WS router. Every registered route answers 405 to
/// methods it doesn't list (via `MethodRouter::fallback`); anything that
/// doesn't match a route at all falls through to `not_found`.
///
/// `matchit` (axum's router) requires a named parameter to span an entire
/// path segment, so `/frame/<viewId>.png` can't be expressed as a single
/// route pattern — `{view_id}.png` glues a literal suffix onto the
/// parameter within one segment, which `matchit` rejects at insertion time.
/// Route on the bare segment instead and strip/validate the `.png` suffix
/// inside the handler.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(status::healthz).fallback(method_not_allowed))
        .route("/status.json", get(status::status_json).fallback(method_not_allowed))
        .route("/frame.png", get(frame::get_frame_legacy).fallback(method_not_allowed))
        .route(
            "/frame/{view_id_png}",
            get(frame::get_frame_by_path).fallback(method_not_allowed),
        )
        .route("/ws", get(crate::ws::handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn method_not_allowed() -> Response {
    BridgeError::MethodNotAllowed.into_response()
}

async fn not_found() -> Response {
    BridgeError::NotFound.into_response()
}
