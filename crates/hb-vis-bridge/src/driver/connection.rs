use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::DriverError;

struct CdpEvent {
    method: String,
    params: Value,
}

/// Per-target WebSocket CDP connection.
///
/// Each page gets its own connection — no multiplexing, no contention.
/// Reads are inline (no background dispatch task) since each connection is
/// single-owner: exactly one view session's capture loop drives it.
pub struct CdpConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    event_buffer: Vec<CdpEvent>,
}

impl CdpConnection {
    pub async fn connect(url: &str) -> Result<Self, DriverError> {
        debug!(url, "connecting CDP WebSocket");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| DriverError::Launch(format!("failed to connect to {url}: {e}")))?;
        Ok(Self {
            ws,
            next_id: 1,
            event_buffer: Vec::new(),
        })
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id;
        self.next_id += 1;

        let msg = json!({ "id": id, "method": method, "params": params });
        self.ws
            .send(Message::Text(msg.to_string().into()))
            .await
            .map_err(|e| format!("send {method} failed: {e}"))?;

        loop {
            let raw = self
                .ws
                .next()
                .await
                .ok_or_else(|| "websocket closed while waiting for response".to_string())?
                .map_err(|e| format!("websocket error: {e}"))?;

            let Message::Text(text) = raw else { continue };
            let parsed: Value =
                serde_json::from_str(&text).map_err(|e| format!("bad CDP message: {e}"))?;

            if parsed.get("id").and_then(|v| v.as_u64()) == Some(id) {
                if let Some(error) = parsed.get("error") {
                    return Err(format!("CDP error for {method}: {error}"));
                }
                return Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
            }

            if let Some(event_method) = parsed.get("method").and_then(|v| v.as_str()) {
                self.event_buffer.push(CdpEvent {
                    method: event_method.to_string(),
                    params: parsed.get("params").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }

    async fn wait_event(&mut self, method: &str, timeout: Duration) -> Result<Value, String> {
        if let Some(idx) = self.event_buffer.iter().position(|e| e.method == method) {
            return Ok(self.event_buffer.remove(idx).params);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(format!("timed out waiting for {method}"));
            }
            let raw = match tokio::time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(raw))) => raw,
                Ok(Some(Err(e))) => return Err(format!("websocket error: {e}")),
                Ok(None) => return Err("websocket closed while waiting for event".to_string()),
                Err(_) => return Err(format!("timed out waiting for {method}")),
            };
            let Message::Text(text) = raw else { continue };
            let parsed: Value =
                serde_json::from_str(&text).map_err(|e| format!("bad CDP message: {e}"))?;
            if let Some(event_method) = parsed.get("method").and_then(|v| v.as_str()) {
                let params = parsed.get("params").cloned().unwrap_or(Value::Null);
                if event_method == method {
                    return Ok(params);
                }
                self.event_buffer.push(CdpEvent {
                    method: event_method.to_string(),
                    params,
                });
            }
        }
    }

    pub async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<(), String> {
        self.event_buffer.clear();
        self.call("Page.navigate", json!({"url": url})).await?;
        self.wait_event(
            "Page.domContentEventFired",
            Duration::from_millis(timeout_ms),
        )
        .await
        .map(|_| ())
    }

    pub async fn reload(&mut self, timeout_ms: u64) -> Result<(), String> {
        self.event_buffer.clear();
        self.call("Page.reload", json!({"ignoreCache": false})).await?;
        self.wait_event(
            "Page.domContentEventFired",
            Duration::from_millis(timeout_ms),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), String> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn enable_domains(&mut self) -> Result<(), String> {
        self.call("Page.enable", json!({})).await?;
        self.call("Network.enable", json!({})).await?;
        self.call("Runtime.enable", json!({})).await?;
        Ok(())
    }

    /// Install the fetch interceptors described in the spec: requests for
    /// `vis-views.json`/`vis-user.css` (under any `vis.0` path, any query
    /// string) are forwarded with `cache-control`/`pragma: no-cache` added,
    /// defeating the dashboard's legacy offline-manifest cache.
    pub async fn enable_cache_bust_interception(&mut self) -> Result<(), String> {
        self.call(
            "Fetch.enable",
            json!({
                "patterns": [
                    {"urlPattern": "*vis.0*vis-views.json*", "requestStage": "Request"},
                    {"urlPattern": "*vis.0*vis-user.css*", "requestStage": "Request"},
                ]
            }),
        )
        .await
        .map(|_| ())
    }

    /// Drain and answer any buffered/incoming `Fetch.requestPaused` events
    /// with augmented no-cache headers. Called opportunistically between
    /// capture-loop iterations — a stalled interceptor would otherwise hang
    /// the matched request forever.
    pub async fn service_pending_fetch_events(&mut self) -> Result<(), String> {
        let pending: Vec<Value> = self
            .event_buffer
            .iter()
            .filter(|e| e.method == "Fetch.requestPaused")
            .map(|e| e.params.clone())
            .collect();
        self.event_buffer.retain(|e| e.method != "Fetch.requestPaused");

        for params in pending {
            let Some(request_id) = params.get("requestId").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut headers: Vec<Value> = params
                .get("request")
                .and_then(|r| r.get("headers"))
                .and_then(|h| h.as_object())
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| json!({"name": k, "value": v}))
                        .collect()
                })
                .unwrap_or_default();
            headers.push(json!({"name": "cache-control", "value": "no-cache"}));
            headers.push(json!({"name": "pragma", "value": "no-cache"}));

            self.call(
                "Fetch.continueRequest",
                json!({"requestId": request_id, "headers": headers}),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<Value, String> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({"expression": expression, "returnByValue": true}),
            )
            .await?;
        Self::check_js_exception(&result)?;
        Ok(result)
    }

    pub async fn evaluate_async(&mut self, expression: &str) -> Result<Value, String> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        Self::check_js_exception(&result)?;
        Ok(result)
    }

    pub async fn add_script_to_evaluate_on_new_document(
        &mut self,
        source: &str,
    ) -> Result<(), String> {
        self.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({"source": source}),
        )
        .await
        .map(|_| ())
    }

    /// Best-effort: tell the page it prefers reduced motion, so any CSS
    /// gated on `@media (prefers-reduced-motion: reduce)` takes effect
    /// before the next screenshot. Caret hiding and a hard animation/
    /// transition cutoff are handled unconditionally by the stylesheet in
    /// [`crate::render::scripts::INIT_SCRIPT`], since this media feature
    /// only affects pages that opt into the query. Falls back silently if
    /// `Emulation.setEmulatedMedia` is unsupported.
    pub async fn try_disable_animations(&mut self) {
        let _ = self
            .call(
                "Emulation.setEmulatedMedia",
                json!({"features": [{"name": "prefers-reduced-motion", "value": "reduce"}]}),
            )
            .await;
    }

    pub async fn capture_screenshot(&mut self) -> Result<Vec<u8>, String> {
        self.try_disable_animations().await;
        let result = self
            .call("Page.captureScreenshot", json!({"format": "png"}))
            .await?;
        let b64 = result["data"]
            .as_str()
            .ok_or_else(|| "no screenshot data in response".to_string())?;
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| format!("failed to decode screenshot: {e}"))
    }

    fn check_js_exception(result: &Value) -> Result<(), String> {
        if let Some(desc) = result
            .get("exceptionDetails")
            .and_then(|e| e.get("exception"))
            .and_then(|e| e.get("description"))
            .and_then(|d| d.as_str())
        {
            return Err(format!("JS error: {desc}"));
        }
        Ok(())
    }
}
