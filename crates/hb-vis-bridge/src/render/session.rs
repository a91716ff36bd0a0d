use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn};
use tracing::Instrument;

use crate::config::{BURST_WINDOW_MS, NAV_TIMEOUT_MS, QUIET_SLEEP_MS, ViewConfig};
use crate::driver::{Browser, Page, ViewportSize};

use super::frame::Frame;
use super::reload::cache_busted_url;
use super::scripts;

/// Event published by a session's capture loop when it publishes a new
/// frame. Consumed by the pool's fan-out task.
pub enum SessionEvent {
    Frame { view_id: String, frame: Frame },
}

/// Per-view-id mutable state. Guarded by a single async mutex — written
/// only by the session's own loop and by the activation paths
/// (`tick`/`subscribe`/`touch_http`), per the spec's shared-resource policy.
pub struct SessionState {
    pub view: ViewConfig,
    pub page: Option<Box<dyn Page>>,
    pub subscribers: u32,
    pub last_http_seen_ts: Option<Instant>,
    pub last_inactive_ts: Option<Instant>,
    pub want_capture_now: bool,
    pub want_reload_now: bool,
    pub probe_ms: u64,
    pub last_reload_ts: Option<Instant>,
    pub last_capture_ts: Option<Instant>,
    pub last_change_ts: Option<Instant>,
    pub last_error: Option<String>,
    pub last_frame: Option<Frame>,
    pub cache_bust_on_reload: bool,
    pub auto_reload_ms: u64,
}

impl SessionState {
    fn new(view: ViewConfig, cache_bust_on_reload: bool, auto_reload_ms: u64) -> Self {
        let probe_ms = view.capture_min_interval_ms;
        Self {
            view,
            page: None,
            subscribers: 0,
            last_http_seen_ts: None,
            last_inactive_ts: None,
            want_capture_now: true,
            want_reload_now: false,
            probe_ms,
            last_reload_ts: None,
            last_capture_ts: None,
            last_change_ts: None,
            last_error: None,
            last_frame: None,
            cache_bust_on_reload,
            auto_reload_ms,
        }
    }

    /// `subscribers > 0 OR now - max(lastHttpSeenTs, lastInactiveTs) <= inactiveGraceMs`.
    pub fn wanted(&self, now: Instant, inactive_grace_ms: u64) -> bool {
        if self.subscribers > 0 {
            return true;
        }
        let grace = Duration::from_millis(inactive_grace_ms);
        let recent = [self.last_http_seen_ts, self.last_inactive_ts]
            .into_iter()
            .flatten()
            .max();
        match recent {
            Some(t) => now.saturating_duration_since(t) <= grace,
            None => false,
        }
    }
}

/// Owns one view's rendering pipeline: the loop task, its stop flag, and the
/// guarded state the loop and activation paths share.
pub struct ViewSession {
    pub id: String,
    pub state: Arc<Mutex<SessionState>>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    join: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    inactive_grace_ms: u64,
    viewport: ViewportSize,
}

impl ViewSession {
    pub fn new(
        view: ViewConfig,
        cache_bust_on_reload: bool,
        auto_reload_ms: u64,
        inactive_grace_ms: u64,
        viewport: ViewportSize,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let id = view.id.clone();
        let state = Arc::new(Mutex::new(SessionState::new(
            view,
            cache_bust_on_reload,
            auto_reload_ms,
        )));
        Arc::new(Self {
            id,
            state,
            running: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
            join: Mutex::new(None),
            events_tx,
            inactive_grace_ms,
            viewport,
        })
    }

    /// Start the capture loop task if it isn't already running. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut join = self.join.lock().await;
        if join.is_some() {
            return;
        }
        let session = self.clone();
        let span = info_span!("session", view = %session.id);
        *join = Some(tokio::spawn(async move { session.run_loop().await }.instrument(span)));
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Interrupt the running loop at its next suspension point, await its
    /// exit, then close the page.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let page = self.state.lock().await.page.take();
        if let Some(page) = page {
            let _ = page.close().await;
        }
    }

    /// Activation gating, run on every 1 Hz maintenance tick and once
    /// synchronously right after an admitted subscribe/touch-HTTP to
    /// accelerate first-frame delivery.
    pub async fn tick(&self, browser: Option<&Arc<dyn Browser>>, close_page_after_inactive_ms: u64) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let wanted = state.wanted(now, self.inactive_grace_ms);

        if !wanted {
            if state.page.is_some() {
                let idle_since = [state.last_http_seen_ts, state.last_inactive_ts]
                    .into_iter()
                    .flatten()
                    .max();
                let idle_ms = idle_since
                    .map(|t| now.saturating_duration_since(t).as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if idle_ms >= close_page_after_inactive_ms {
                    if let Some(page) = state.page.take() {
                        let _ = page.close().await;
                    }
                }
            }
            return;
        }

        if state.page.is_none() {
            let Some(browser) = browser else { return };
            match browser.new_page(self.viewport).await {
                Ok(mut page) => {
                    if let Err(e) = page.set_init_script(scripts::INIT_SCRIPT).await {
                        warn!(view = %self.id, error = %e, "failed to install init script");
                    }
                    state.page = Some(page);
                    state.want_capture_now = true;
                }
                Err(e) => {
                    state.last_error = Some(e.to_string());
                    warn!(view = %self.id, error = %e, "failed to open page");
                    return;
                }
            }
        }

        let url = state.view.url.clone();
        let current = state.page.as_ref().and_then(|p| p.current_url());
        if current.as_deref() != Some(url.as_str()) {
            if let Some(page) = state.page.as_mut() {
                if let Err(e) = page.navigate(&url, NAV_TIMEOUT_MS).await {
                    state.last_error = Some(e.to_string());
                    warn!(view = %self.id, error = %e, "navigation failed");
                }
            }
        }
    }

    /// Replace the active view configuration (e.g. URL changed), raise
    /// `wantCaptureNow`, and reset the probe interval.
    pub async fn set_view(&self, view: ViewConfig) {
        let mut state = self.state.lock().await;
        state.probe_ms = view.capture_min_interval_ms;
        state.view = view;
        state.want_capture_now = true;
        drop(state);
        self.wake();
    }

    pub async fn subscribe(&self) {
        let mut state = self.state.lock().await;
        state.subscribers += 1;
        state.last_inactive_ts = None;
        state.want_capture_now = true;
        drop(state);
        self.wake();
    }

    pub async fn unsubscribe(&self) {
        let mut state = self.state.lock().await;
        if state.subscribers > 0 {
            state.subscribers -= 1;
        }
        if state.subscribers == 0 {
            state.last_inactive_ts = Some(Instant::now());
        }
    }

    pub async fn touch_http(&self) {
        let mut state = self.state.lock().await;
        state.last_http_seen_ts = Some(Instant::now());
        state.last_inactive_ts = None;
        state.want_capture_now = true;
        drop(state);
        self.wake();
    }

    pub async fn is_wanted(&self) -> bool {
        let state = self.state.lock().await;
        state.wanted(Instant::now(), self.inactive_grace_ms)
    }

    pub async fn has_page(&self) -> bool {
        self.state.lock().await.page.is_some()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    async fn run_loop(self: Arc<Self>) {
        debug!(view = %self.id, "capture loop started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.iterate().await {
                let mut state = self.state.lock().await;
                state.last_error = Some(e.clone());
                warn!(view = %self.id, error = %e, "capture iteration failed");
                drop(state);
                self.sleep_or_wake(Duration::from_millis(1000)).await;
                continue;
            }
        }
        debug!(view = %self.id, "capture loop exiting");
    }

    async fn sleep_or_wake(&self, dur: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// One capture-loop iteration. Returns `Err` on any driver failure; the
    /// caller records it in `lastError` and backs off — failures never
    /// propagate further.
    async fn iterate(&self) -> Result<(), String> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if !state.wanted(now, self.inactive_grace_ms) || state.page.is_none() {
            drop(state);
            self.sleep_or_wake(Duration::from_millis(QUIET_SLEEP_MS)).await;
            return Ok(());
        }

        let should_reload = state.want_reload_now
            || (state.auto_reload_ms > 0
                && state
                    .last_reload_ts
                    .is_none_or(|t| now.saturating_duration_since(t).as_millis() as u64 >= state.auto_reload_ms));

        if should_reload {
            state.want_reload_now = false;
            self.perform_reload(&mut state).await?;
            drop(state);
            self.sleep_or_wake(Duration::from_millis(QUIET_SLEEP_MS)).await;
            return Ok(());
        }

        let mut capture = false;
        if state.want_capture_now {
            capture = true;
            state.want_capture_now = false;
        } else {
            let dirty = {
                let page = state.page.as_mut().expect("page checked above");
                page.evaluate(scripts::CONSUME_DIRTY_JS)
                    .await
                    .map_err(|e| e.to_string())?
            };
            let is_dirty = dirty.get("result").and_then(|r| r.get("value")).and_then(|v| v.as_bool()).unwrap_or(false);
            if is_dirty {
                capture = true;
                state.last_change_ts = Some(now);
                state.probe_ms = state.view.capture_min_interval_ms;
            } else if state
                .last_capture_ts
                .is_none_or(|t| now.saturating_duration_since(t).as_millis() as u64 >= state.probe_ms)
            {
                capture = true;
            }
        }

        if capture {
            let recent_change = state
                .last_change_ts
                .is_some_and(|t| now.saturating_duration_since(t).as_millis() as u64 <= BURST_WINDOW_MS);
            let too_soon = state
                .last_capture_ts
                .is_some_and(|t| now.saturating_duration_since(t).as_millis() as u64 < state.view.capture_min_interval_ms);
            if recent_change && too_soon {
                let wait_ms = state.view.capture_min_interval_ms;
                drop(state);
                self.sleep_or_wake(Duration::from_millis(wait_ms)).await;
                return Ok(());
            }
        }

        if !capture {
            drop(state);
            self.sleep_or_wake(Duration::from_millis(QUIET_SLEEP_MS)).await;
            return Ok(());
        }

        {
            let page = state.page.as_mut().expect("page checked above");
            page.evaluate_async(scripts::PAINT_DEBOUNCE_JS)
                .await
                .map_err(|e| e.to_string())?;
        }

        let png = {
            let page = state.page.as_mut().expect("page checked above");
            page.screenshot().await.map_err(|e| e.to_string())?
        };
        state.last_capture_ts = Some(now);

        let frame = Frame::new(png);
        let changed = state.last_frame.as_ref().is_none_or(|f| f.etag != frame.etag);
        if changed {
            state.last_frame = Some(frame.clone());
            state.probe_ms = state.view.capture_min_interval_ms;
            state.last_change_ts = Some(now);
            debug!(view = %self.id, etag = %frame.etag, ts = frame.ts, "frame published");
            let _ = self.events_tx.send(SessionEvent::Frame {
                view_id: self.id.clone(),
                frame,
            });
        } else {
            state.probe_ms = (state.probe_ms as f64 * 1.5).floor() as u64;
            state.probe_ms = state.probe_ms.min(state.view.capture_max_interval_ms);
        }

        Ok(())
    }

    async fn perform_reload(&self, state: &mut SessionState) -> Result<(), String> {
        let page = state.page.as_mut().expect("page checked by caller");
        let current = page.current_url().unwrap_or_default();
        let target = cache_busted_url(&current, state.cache_bust_on_reload);

        let result = if target != current {
            page.navigate(&target, NAV_TIMEOUT_MS).await
        } else {
            page.reload(NAV_TIMEOUT_MS).await
        };

        if let Err(e) = result {
            state.last_error = Some(e.to_string());
            warn!(view = %self.id, error = %e, "reload failed");
            return Ok(());
        }

        let _ = page.evaluate(scripts::MARK_DIRTY_JS).await;
        state.last_reload_ts = Some(Instant::now());
        state.want_capture_now = true;
        state.probe_ms = state.view.capture_min_interval_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewConfig as Vc;

    fn view(id: &str) -> Vc {
        Vc {
            id: id.to_string(),
            url: "http://example.invalid/x".to_string(),
            enabled: true,
            name: None,
            busy_fps: 10,
            capture_min_interval_ms: 200,
            capture_max_interval_ms: 2000,
        }
    }

    #[test]
    fn wanted_true_with_subscribers() {
        let mut state = SessionState::new(view("a"), false, 0);
        state.subscribers = 1;
        assert!(state.wanted(Instant::now(), 5000));
    }

    #[test]
    fn wanted_false_when_no_activity_and_no_subscribers() {
        let mut state = SessionState::new(view("a"), false, 0);
        state.want_capture_now = false;
        assert!(!state.wanted(Instant::now(), 5000));
    }

    #[test]
    fn wanted_true_within_grace_after_http_touch() {
        let mut state = SessionState::new(view("a"), false, 0);
        state.last_http_seen_ts = Some(Instant::now());
        assert!(state.wanted(Instant::now(), 5000));
    }

    #[test]
    fn probe_ms_bounds_hold_after_init() {
        let state = SessionState::new(view("a"), false, 0);
        assert!(state.probe_ms >= state.view.capture_min_interval_ms);
        assert!(state.probe_ms <= state.view.capture_max_interval_ms);
    }

    use crate::driver::fake::FakeBrowser;

    /// S1-style: an admitted subscribe against a fresh session produces a
    /// `frame` event carrying a 42-char quoted-SHA1 ETag, without needing a
    /// real browser.
    #[tokio::test]
    async fn activated_session_publishes_a_cold_start_frame() {
        let browser = FakeBrowser::new();
        let browser_dyn: Arc<dyn Browser> = browser.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ViewSession::new(
            view("a"),
            false,
            0,
            5_000,
            crate::driver::ViewportSize {
                width: 10,
                height: 10,
            },
            tx,
        );

        session.subscribe().await;
        session.tick(Some(&browser_dyn), 15_000).await;
        session.start().await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame published before timeout")
            .expect("events channel open");
        match event {
            SessionEvent::Frame { view_id, frame } => {
                assert_eq!(view_id, "a");
                assert_eq!(frame.etag.len(), 42);
            }
        }

        session.stop().await;
    }

    /// Property 7: two identical screenshots in a row publish exactly one
    /// `onFrame` — the second, unchanged capture only backs off `probeMs`.
    #[tokio::test]
    async fn unchanged_screenshot_does_not_republish() {
        let browser = FakeBrowser::new();
        let browser_dyn: Arc<dyn Browser> = browser.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ViewSession::new(
            view("a"),
            false,
            0,
            5_000,
            crate::driver::ViewportSize {
                width: 10,
                height: 10,
            },
            tx,
        );

        session.subscribe().await;
        session.tick(Some(&browser_dyn), 15_000).await;
        session.start().await;

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first frame published")
            .expect("events channel open");
        let SessionEvent::Frame { .. } = first;

        // No further DOM mutation, same screenshot bytes: the probe timer
        // will keep re-capturing, but ETag never changes, so no further
        // event should arrive.
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(second.is_err(), "unchanged screenshot must not republish");

        session.stop().await;
    }
}
