use axum::Json;
use axum::extract::State;
use serde_json::json;

use super::AppState;

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

pub async fn status_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.pool.config();
    let active_views = state.pool.active_view_ids().await;

    Json(json!({
        "ok": true,
        "status": {
            "config": {
                "listenHost": config.listen_host,
                "listenPort": config.listen_port,
                "canvasWidth": config.canvas_width,
                "canvasHeight": config.canvas_height,
                "maxActiveViews": config.max_active_views,
                "inactiveGraceMs": config.inactive_grace_ms,
                "closePageAfterInactiveMs": config.close_page_after_inactive_ms,
                "closeBrowserAfterInactiveMs": config.close_browser_after_inactive_ms,
            },
            "activeViewId": state.default_view,
            "pool": {
                "activeViews": active_views,
            },
        },
    }))
}
