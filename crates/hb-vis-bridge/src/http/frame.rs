use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::error::BridgeError;

use super::AppState;
use super::auth;

#[derive(Deserialize, Default)]
pub struct FrameQuery {
    pub token: Option<String>,
    #[serde(rename = "viewId")]
    pub view_id: Option<String>,
}

pub async fn get_frame_by_path(
    State(state): State<AppState>,
    Path(view_id_png): Path<String>,
    Query(query): Query<FrameQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(view_id) = view_id_png.strip_suffix(".png") else {
        return BridgeError::NotFound.into_response();
    };
    serve_frame(&state, view_id, &query, &headers).await
}

pub async fn get_frame_legacy(
    State(state): State<AppState>,
    Query(query): Query<FrameQuery>,
    headers: HeaderMap,
) -> Response {
    let view_id = query.view_id.clone().or_else(|| state.default_view.clone());
    let Some(view_id) = view_id else {
        return BridgeError::UnknownView.into_response();
    };
    serve_frame(&state, &view_id, &query, &headers).await
}

async fn serve_frame(state: &AppState, view_id: &str, query: &FrameQuery, headers: &HeaderMap) -> Response {
    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !auth::check(state.auth_token.as_deref(), query.token.as_deref(), auth_header) {
        return BridgeError::Unauthorized.into_response();
    }

    let enabled = match state.pool.config().view(view_id) {
        Some(v) => v.enabled,
        None => return BridgeError::UnknownView.into_response(),
    };
    if !enabled {
        return BridgeError::UnknownView.into_response();
    }

    if let Err(e) = state.pool.touch_http(view_id).await {
        return e.into_response();
    }

    let Some(frame) = state.pool.get_frame_or_wait(view_id).await else {
        return BridgeError::NoFrame {
            view_id: view_id.to_string(),
        }
        .into_response();
    };

    let if_none_match = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok());
    if if_none_match == Some(frame.etag.as_ref()) {
        return (
            StatusCode::NOT_MODIFIED,
            [
                (header::ETAG, frame.etag.to_string()),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::ETAG, frame.etag.to_string()),
        ],
        frame.png.to_vec(),
    )
        .into_response()
}
