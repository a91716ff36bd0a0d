use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connection::CdpConnection;
use super::{Browser, BrowserFactory, Page, ViewportSize};
use crate::error::DriverError;

static BROWSER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Launches a real headless Chrome and drives it over the CDP HTTP + WS
/// JSON API. The only [`BrowserFactory`] this crate ships — tests use an
/// in-memory fake instead.
pub struct ChromeFactory {
    /// `http://host:port` of a Chrome to attach to instead of spawning one.
    pub remote_url: Option<String>,
}

#[async_trait]
impl BrowserFactory for ChromeFactory {
    async fn launch(&self) -> Result<Arc<dyn Browser>, DriverError> {
        let chrome = match &self.remote_url {
            Some(url) => ChromeProcess::connect(url).await?,
            None => ChromeProcess::launch().await?,
        };
        Ok(Arc::new(ChromeBrowser {
            chrome: Mutex::new(chrome),
        }))
    }
}

/// Chrome process lifecycle: launch (or attach to a remote), create tabs, kill.
struct ChromeProcess {
    child: Option<Child>,
    host_port: String,
    data_dir: Option<PathBuf>,
}

impl ChromeProcess {
    async fn launch() -> Result<Self, DriverError> {
        let id = BROWSER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let data_dir =
            std::env::temp_dir().join(format!("hb-vis-bridge-{}-{id}", std::process::id()));

        let chrome_path = find_chrome()
            .ok_or_else(|| DriverError::Launch("no Chrome/Chromium executable found".into()))?;
        info!(path = %chrome_path, "launching local Chrome");

        let mut child = Command::new(chrome_path)
            .args([
                "--headless=new",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-application-cache",
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-extensions",
                "--disable-background-networking",
                "--disable-background-timer-throttling",
                "--disable-backgrounding-occluded-windows",
                "--disable-renderer-backgrounding",
                "--disable-ipc-flooding-protection",
                "--disable-sync",
                "--disable-translate",
                "--mute-audio",
                "--hide-scrollbars",
                "--remote-debugging-port=0",
            ])
            .arg(format!("--user-data-dir={}", data_dir.display()))
            .stderr(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| DriverError::Launch(format!("failed to spawn Chrome: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::Launch("no stderr from Chrome".into()))?;
        let mut lines = tokio::io::BufReader::new(stderr).lines();

        let debug_url = loop {
            let line = tokio::time::timeout(std::time::Duration::from_secs(10), lines.next_line())
                .await
                .map_err(|_| DriverError::Launch("timed out waiting for DevTools URL".into()))?
                .map_err(|e| DriverError::Launch(format!("failed to read Chrome stderr: {e}")))?;

            match line {
                Some(ref text) if text.contains("DevTools listening on ") => {
                    break text
                        .split("DevTools listening on ")
                        .nth(1)
                        .ok_or_else(|| DriverError::Launch("failed to parse DevTools URL".into()))?
                        .trim()
                        .to_string();
                }
                Some(_) => continue,
                None => return Err(DriverError::Launch("Chrome exited before printing DevTools URL".into())),
            }
        };

        debug!(url = %debug_url, "Chrome DevTools URL discovered");
        let host_port = parse_host_port(&debug_url)?;

        Ok(Self {
            child: Some(child),
            host_port,
            data_dir: Some(data_dir),
        })
    }

    async fn connect(base_url: &str) -> Result<Self, DriverError> {
        let base = base_url.trim_end_matches('/');
        let version_url = format!("{base}/json/version");
        let host_port = base
            .split("://")
            .nth(1)
            .ok_or_else(|| DriverError::Launch("invalid chrome_url: no scheme".into()))?
            .to_string();

        info!(url = %version_url, "connecting to remote Chrome");
        reqwest::get(&version_url)
            .await
            .map_err(|e| DriverError::Launch(format!("failed to reach {version_url}: {e}")))?
            .error_for_status()
            .map_err(|e| DriverError::Launch(format!("Chrome /json/version returned error: {e}")))?;

        Ok(Self {
            child: None,
            host_port,
            data_dir: None,
        })
    }

    async fn create_tab(&self) -> Result<(String, String), DriverError> {
        let url = format!("http://{}/json/new?about:blank", self.host_port);
        let resp: serde_json::Value = reqwest::Client::new()
            .put(&url)
            .send()
            .await
            .map_err(|e| DriverError::Launch(format!("PUT /json/new failed: {e}")))?
            .json()
            .await
            .map_err(|e| DriverError::Launch(format!("bad /json/new response: {e}")))?;

        let target_id = resp["id"]
            .as_str()
            .ok_or_else(|| DriverError::Launch("no id in /json/new response".into()))?
            .to_string();
        let ws_url = format!("ws://{}/devtools/page/{target_id}", self.host_port);
        Ok((target_id, ws_url))
    }

    async fn close_tab(&self, target_id: &str) {
        let url = format!("http://{}/json/close/{target_id}", self.host_port);
        if let Err(e) = reqwest::get(&url).await {
            warn!(error = %e, target_id, "failed to close tab");
        }
    }

    fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        self.kill();
        if let Some(dir) = &self.data_dir {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

struct ChromeBrowser {
    chrome: Mutex<ChromeProcess>,
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_page(&self, viewport: ViewportSize) -> Result<Box<dyn Page>, DriverError> {
        let (target_id, ws_url, host_port) = {
            let guard = self.chrome.lock().await;
            let (target_id, ws_url) = guard.create_tab().await?;
            (target_id, ws_url, guard.host_port.clone())
        };
        debug!(target_id = %target_id, "connecting to tab");
        let mut conn = CdpConnection::connect(&ws_url).await?;
        conn.enable_domains().await.map_err(DriverError::Launch)?;
        conn.enable_cache_bust_interception()
            .await
            .map_err(DriverError::Launch)?;
        conn.set_viewport(viewport.width, viewport.height)
            .await
            .map_err(DriverError::Launch)?;
        Ok(Box::new(ChromePage {
            conn,
            target_id,
            host_port,
            current_url: None,
        }))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.chrome.lock().await.kill();
        Ok(())
    }
}

struct ChromePage {
    conn: CdpConnection,
    target_id: String,
    host_port: String,
    current_url: Option<String>,
}

#[async_trait]
impl Page for ChromePage {
    fn current_url(&self) -> Option<String> {
        self.current_url.clone()
    }

    async fn set_init_script(&mut self, script: &str) -> Result<(), DriverError> {
        self.conn
            .add_script_to_evaluate_on_new_document(script)
            .await
            .map_err(DriverError::Launch)
    }

    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<(), DriverError> {
        self.conn
            .service_pending_fetch_events()
            .await
            .map_err(DriverError::Navigate)?;
        self.conn
            .navigate(url, timeout_ms)
            .await
            .map_err(DriverError::Navigate)?;
        self.current_url = Some(url.to_string());
        Ok(())
    }

    async fn reload(&mut self, timeout_ms: u64) -> Result<(), DriverError> {
        self.conn
            .service_pending_fetch_events()
            .await
            .map_err(DriverError::Reload)?;
        self.conn.reload(timeout_ms).await.map_err(DriverError::Reload)
    }

    async fn evaluate(&mut self, expression: &str) -> Result<serde_json::Value, DriverError> {
        self.conn.evaluate(expression).await.map_err(DriverError::Evaluate)
    }

    async fn evaluate_async(&mut self, expression: &str) -> Result<serde_json::Value, DriverError> {
        self.conn
            .evaluate_async(expression)
            .await
            .map_err(DriverError::Evaluate)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        self.conn
            .capture_screenshot()
            .await
            .map_err(DriverError::Screenshot)
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        let url = format!("http://{}/json/close/{}", self.host_port, self.target_id);
        drop(self.conn);
        if let Err(e) = reqwest::get(&url).await {
            warn!(error = %e, target_id = %self.target_id, "failed to close tab");
        }
        Ok(())
    }
}

fn parse_host_port(ws_url: &str) -> Result<String, DriverError> {
    let after_scheme = ws_url
        .split("://")
        .nth(1)
        .ok_or_else(|| DriverError::Launch("invalid WebSocket URL: no scheme".into()))?;
    let host_port = after_scheme
        .split('/')
        .next()
        .ok_or_else(|| DriverError::Launch("invalid WebSocket URL: no host:port".into()))?;
    Ok(host_port.to_string())
}

fn find_chrome() -> Option<String> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else {
        &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"]
    };

    for path in candidates {
        if std::path::Path::new(path).exists() {
            return Some(path.to_string());
        }
    }
    if !cfg!(target_os = "macos") {
        for name in candidates {
            if std::process::Command::new("which")
                .arg(name)
                .output()
                .is_ok_and(|o| o.status.success())
            {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_from_ws_url() {
        let hp = parse_host_port("ws://127.0.0.1:9222/devtools/browser/abc").unwrap();
        assert_eq!(hp, "127.0.0.1:9222");
    }
}
