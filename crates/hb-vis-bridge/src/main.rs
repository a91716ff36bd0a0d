use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use hb_vis_bridge::config;

/// Renders web dashboards into a stream of PNG frames for an LED-matrix
/// display, over HTTP (ETag-cached) and WebSocket (push) transports.
#[derive(Parser, Debug)]
#[command(name = "hb-vis-bridge")]
struct Cli {
    /// Path to the TOML config file. Overlaid by environment variables,
    /// then by the flags below (file < env < CLI).
    #[arg(long, default_value = "./hb-vis-bridge.toml")]
    config: PathBuf,

    #[arg(long)]
    listen_host: Option<String>,

    #[arg(long)]
    listen_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut raw = config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if let Some(host) = cli.listen_host {
        raw.listen_host = Some(host);
    }
    if let Some(port) = cli.listen_port {
        raw.listen_port = Some(port as f64);
    }

    let resolved = config::Config::resolve(raw);
    hb_vis_bridge::run(resolved).await
}

fn init_tracing() {
    let filter = std::env::var("HB_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "hb_vis_bridge=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
