use serde::{Deserialize, Serialize};

/// Raw `[[views]]` entry as it appears in TOML, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawViewConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub busy_fps: Option<f64>,
}

/// Validated, immutable-for-the-session-lifetime view configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewConfig {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub name: Option<String>,
    pub busy_fps: u32,
    /// `max(50, floor(1000 / busy_fps))`, overriding the pool's global
    /// `capture_min_interval_ms` for this view's session.
    pub capture_min_interval_ms: u64,
    /// The pool's global max, clamped up to be `>= capture_min_interval_ms`.
    pub capture_max_interval_ms: u64,
}

impl ViewConfig {
    /// Returns `None` if `id` or `url` is missing — such entries are dropped.
    pub fn from_raw(
        raw: RawViewConfig,
        global_min_ms: u64,
        global_max_ms: u64,
    ) -> Option<Self> {
        let id = raw.id?;
        let url = raw.url?;
        let busy_fps = match raw.busy_fps {
            Some(v) if v.is_finite() => (v as i64).clamp(1, 20) as u32,
            _ => 10,
        };
        let capture_min_interval_ms = (1000 / busy_fps as u64).max(50);
        let capture_max_interval_ms = global_max_ms.max(capture_min_interval_ms);
        let _ = global_min_ms;

        Some(Self {
            id,
            url,
            enabled: raw.enabled.unwrap_or(true),
            name: raw.name,
            busy_fps,
            capture_min_interval_ms,
            capture_max_interval_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_fps_derives_min_interval() {
        let raw = RawViewConfig {
            id: Some("a".into()),
            url: Some("http://x".into()),
            enabled: None,
            name: None,
            busy_fps: Some(20.0),
        };
        let v = ViewConfig::from_raw(raw, 200, 2000).unwrap();
        // floor(1000/20) = 50, already >= the 50ms floor.
        assert_eq!(v.capture_min_interval_ms, 50);
    }

    #[test]
    fn low_busy_fps_floors_at_50ms() {
        let raw = RawViewConfig {
            id: Some("a".into()),
            url: Some("http://x".into()),
            enabled: None,
            name: None,
            busy_fps: Some(1.0),
        };
        let v = ViewConfig::from_raw(raw, 200, 2000).unwrap();
        assert_eq!(v.capture_min_interval_ms, 1000);
        assert!(v.capture_min_interval_ms >= 50);
    }
}
