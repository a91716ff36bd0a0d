//! The WebSocket control channel: `hello`/`subscribe`/`setView` in,
//! `hello_ack`/`subscribed`/`frame`/`error` out. Authenticates identically
//! to the HTTP frame handler; each connection holds at most one
//! subscription at a time (enforced by [`crate::render::SubscriptionRegistry`]).

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;

use crate::http::AppState;
use crate::http::auth;
use crate::render::Subscriber;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let authorized = auth::check(
        state.auth_token.as_deref(),
        query.token.as_deref(),
        auth_header.as_deref(),
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, authorized: bool) {
    if !authorized {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 4001,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let subscriber = Subscriber::new(tx);

    let mut send_task = tokio::spawn(forward_outbound(sender, rx));

    let result = receive_loop(receiver, &state, &subscriber).await;
    if let Err(e) = result {
        warn!(error = %e, "ws connection error");
    }

    state.pool.unsubscribe(subscriber.id).await;
    send_task.abort();
}

/// Drains the outbound channel into the socket until either side closes.
async fn forward_outbound(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(msg) = rx.recv().await {
        if sender.send(Message::Text(msg.to_string().into())).await.is_err() {
            break;
        }
    }
}

async fn receive_loop(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    subscriber: &Subscriber,
) -> Result<(), String> {
    let mut subscribed_view: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let msg_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");

        match msg_type {
            "hello" => handle_hello(state, subscriber, subscribed_view.as_deref()).await,
            "subscribe" | "setView" => {
                if let Some(view_id) = parsed.get("viewId").and_then(Value::as_str) {
                    if handle_subscribe(state, subscriber, view_id).await {
                        subscribed_view = Some(view_id.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

async fn handle_hello(state: &AppState, subscriber: &Subscriber, subscribed_view: Option<&str>) {
    let frame = match subscribed_view {
        Some(id) => state.pool.frame_store().get(id).await,
        None => None,
    };
    subscriber.send(json!({
        "type": "hello_ack",
        "activeViewId": state.default_view,
        "subscribedViewId": subscribed_view,
        "pool": { "activeViews": state.pool.active_view_ids().await },
        "frame": frame.map(|f| json!({ "etag": f.etag.to_string(), "ts": f.ts })),
    }));
}

/// Returns `true` if the subscription was accepted.
async fn handle_subscribe(state: &AppState, subscriber: &Subscriber, view_id: &str) -> bool {
    match state.pool.subscribe(view_id, subscriber.clone()).await {
        Ok(()) => {
            subscriber.send(json!({ "type": "subscribed", "viewId": view_id }));
            true
        }
        Err(e) => {
            let mut body = e.body();
            if let Value::Object(map) = &mut body {
                map.insert("type".to_string(), json!("error"));
                map.insert("viewId".to_string(), json!(view_id));
            }
            subscriber.send(body);
            false
        }
    }
}
