mod view;

pub use view::ViewConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use anyhow::{Context, Result};

/// Clamp helper: non-finite numbers fall back to `default`, finite ones clamp into `[min, max]`.
fn clamp_u64(value: Option<f64>, min: u64, max: u64, default: u64) -> u64 {
    match value {
        Some(v) if v.is_finite() => (v as i64).clamp(min as i64, max as i64) as u64,
        _ => default,
    }
}

fn clamp_u32(value: Option<f64>, min: u32, max: u32, default: u32) -> u32 {
    clamp_u64(value, min as u64, max as u64, default as u64) as u32
}

/// Raw, pre-validation shape of the config file / env overlay. Every field is
/// optional so a partial TOML file or a partial set of env vars only
/// overrides what it mentions; [`Config::resolve`] fills in the rest.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub listen_host: Option<String>,
    #[serde(default)]
    pub listen_port: Option<f64>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub canvas_width: Option<f64>,
    #[serde(default)]
    pub canvas_height: Option<f64>,
    #[serde(default)]
    pub capture_min_interval_ms: Option<f64>,
    #[serde(default)]
    pub capture_max_interval_ms: Option<f64>,
    #[serde(default)]
    pub auto_reload_ms: Option<f64>,
    #[serde(default)]
    pub cache_bust_on_reload: Option<bool>,
    /// `active_view` is accepted as an alias — the distilled spec lists
    /// `defaultView`/`activeView` as the same option under two names.
    #[serde(default, alias = "active_view")]
    pub default_view: Option<String>,
    #[serde(default)]
    pub max_active_views: Option<f64>,
    #[serde(default)]
    pub inactive_grace_ms: Option<f64>,
    #[serde(default)]
    pub close_page_after_inactive_ms: Option<f64>,
    #[serde(default)]
    pub close_browser_after_inactive_ms: Option<f64>,
    #[serde(default)]
    pub views: Vec<view::RawViewConfig>,
}

/// Fully resolved, clamped configuration. Every field here is in-range —
/// range/default-substitution happens once, in [`Config::resolve`], so
/// nothing downstream needs to re-validate.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub auth_token: Option<String>,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub capture_min_interval_ms: u64,
    pub capture_max_interval_ms: u64,
    pub auto_reload_ms: u64,
    pub cache_bust_on_reload: bool,
    pub default_view: Option<String>,
    pub max_active_views: usize,
    pub inactive_grace_ms: u64,
    pub close_page_after_inactive_ms: u64,
    pub close_browser_after_inactive_ms: u64,
    pub views: Vec<ViewConfig>,
}

/// How long an idle capture-loop iteration sleeps before re-checking flags.
/// Not configurable — part of the empirical contract noted in the spec's
/// design notes, like the burst-throttle window and paint-debounce.
pub const QUIET_SLEEP_MS: u64 = 200;
/// Burst-throttle window: a capture within this long of the last detected
/// change is rate-limited to at most one per `capture_min_interval_ms`.
pub const BURST_WINDOW_MS: u64 = 2000;
/// Navigation / reload timeout.
pub const NAV_TIMEOUT_MS: u64 = 45_000;
/// Cold-start HTTP wait bound.
pub const COLD_START_WAIT_MS: u64 = 900;
/// Reservation lifetime.
pub const RESERVATION_TTL_MS: u64 = 5_000;

impl Config {
    pub fn resolve(raw: RawConfig) -> Self {
        let min_default = 200u64;
        let max_default = 2000u64;
        let capture_min_interval_ms = clamp_u64(raw.capture_min_interval_ms, 50, 60_000, min_default);
        let capture_max_interval_ms = clamp_u64(
            raw.capture_max_interval_ms,
            capture_min_interval_ms,
            600_000,
            max_default.max(capture_min_interval_ms),
        );

        let views: Vec<ViewConfig> = raw
            .views
            .into_iter()
            .filter_map(|v| ViewConfig::from_raw(v, capture_min_interval_ms, capture_max_interval_ms))
            .collect();

        let default_view = raw
            .default_view
            .filter(|s| !s.is_empty())
            .or_else(|| views.iter().find(|v| v.enabled).map(|v| v.id.clone()));

        Self {
            listen_host: raw.listen_host.unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port: clamp_u32(raw.listen_port, 1, 65535, 8787) as u16,
            auth_token: raw.auth_token.filter(|t| !t.is_empty()),
            canvas_width: clamp_u32(raw.canvas_width, 1, 8192, 384),
            canvas_height: clamp_u32(raw.canvas_height, 1, 8192, 64),
            capture_min_interval_ms,
            capture_max_interval_ms,
            auto_reload_ms: clamp_u64(raw.auto_reload_ms, 0, 3_600_000, 0),
            cache_bust_on_reload: raw.cache_bust_on_reload.unwrap_or(false),
            default_view,
            max_active_views: clamp_u32(raw.max_active_views, 1, 10, 2) as usize,
            inactive_grace_ms: clamp_u64(raw.inactive_grace_ms, 0, 600_000, 5000),
            close_page_after_inactive_ms: clamp_u64(raw.close_page_after_inactive_ms, 0, 3_600_000, 15_000),
            close_browser_after_inactive_ms: clamp_u64(
                raw.close_browser_after_inactive_ms,
                0,
                3_600_000,
                30_000,
            ),
            views,
        }
    }

    pub fn view(&self, id: &str) -> Option<&ViewConfig> {
        self.views.iter().find(|v| v.id == id)
    }
}

/// Load from a TOML file, then overlay environment variables, matching the
/// file > env > CLI layering used throughout this lineage's config resolution.
pub fn load(path: &Path) -> Result<RawConfig> {
    let mut raw: RawConfig = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        RawConfig::default()
    };

    overlay_env(&mut raw);
    Ok(raw)
}

fn overlay_env(raw: &mut RawConfig) {
    if let Ok(v) = std::env::var("HB_LISTEN_HOST") {
        raw.listen_host = Some(v);
    }
    if let Ok(v) = std::env::var("HB_LISTEN_PORT").ok().and_then(|s| s.parse().ok()) {
        raw.listen_port = Some(v);
    }
    if let Ok(v) = std::env::var("HB_AUTH_TOKEN") {
        raw.auth_token = Some(v);
    }
    if let Ok(v) = std::env::var("HB_DEFAULT_VIEW") {
        raw.default_view = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_clamp() {
        let mut raw = RawConfig::default();
        raw.max_active_views = Some(99.0);
        raw.listen_port = Some(0.0);
        raw.capture_min_interval_ms = Some(1.0);
        let cfg = Config::resolve(raw);
        assert_eq!(cfg.max_active_views, 10);
        assert_eq!(cfg.listen_port, 1);
        assert_eq!(cfg.capture_min_interval_ms, 50);
    }

    #[test]
    fn non_finite_values_fall_back_to_default() {
        let mut raw = RawConfig::default();
        raw.canvas_width = Some(f64::NAN);
        raw.auto_reload_ms = Some(f64::INFINITY);
        let cfg = Config::resolve(raw);
        assert_eq!(cfg.canvas_width, 384);
        assert_eq!(cfg.auto_reload_ms, 0);
    }

    #[test]
    fn capture_max_interval_floors_at_min() {
        let mut raw = RawConfig::default();
        raw.capture_min_interval_ms = Some(5000.0);
        raw.capture_max_interval_ms = Some(100.0);
        let cfg = Config::resolve(raw);
        assert_eq!(cfg.capture_min_interval_ms, 5000);
        assert_eq!(cfg.capture_max_interval_ms, 5000);
    }

    #[test]
    fn views_missing_id_or_url_are_dropped() {
        let mut raw = RawConfig::default();
        raw.views = vec![
            view::RawViewConfig {
                id: Some("a".into()),
                url: Some("http://x/a".into()),
                enabled: None,
                name: None,
                busy_fps: None,
            },
            view::RawViewConfig {
                id: None,
                url: Some("http://x/b".into()),
                enabled: None,
                name: None,
                busy_fps: None,
            },
            view::RawViewConfig {
                id: Some("c".into()),
                url: None,
                enabled: None,
                name: None,
                busy_fps: None,
            },
        ];
        let cfg = Config::resolve(raw);
        assert_eq!(cfg.views.len(), 1);
        assert_eq!(cfg.views[0].id, "a");
    }

    #[test]
    fn default_view_falls_back_to_first_enabled() {
        let mut raw = RawConfig::default();
        raw.views = vec![
            view::RawViewConfig {
                id: Some("a".into()),
                url: Some("http://x/a".into()),
                enabled: Some(false),
                name: None,
                busy_fps: None,
            },
            view::RawViewConfig {
                id: Some("b".into()),
                url: Some("http://x/b".into()),
                enabled: None,
                name: None,
                busy_fps: None,
            },
        ];
        let cfg = Config::resolve(raw);
        assert_eq!(cfg.default_view.as_deref(), Some("b"));
    }
}
