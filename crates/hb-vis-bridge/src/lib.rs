pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod render;
pub mod ws;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use config::Config;
use driver::BrowserFactory;
use driver::chrome::ChromeFactory;
use render::RendererPool;

/// Builds the renderer pool and HTTP/WS listener from a resolved config and
/// runs until the listener is closed or an unrecoverable bind error occurs.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let auth_token = config.auth_token.clone();
    let default_view = config.default_view.clone();

    let remote_url = std::env::var("HB_CHROME_URL").ok();
    let factory: Arc<dyn BrowserFactory> = Arc::new(ChromeFactory { remote_url });

    let (pool, events_rx) = RendererPool::new(config, factory);
    pool.spawn_background_tasks(events_rx);

    let state = http::AppState {
        pool,
        auth_token,
        default_view,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "hb-vis-bridge listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
