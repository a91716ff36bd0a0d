use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::json;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{COLD_START_WAIT_MS, Config, RESERVATION_TTL_MS};
use crate::driver::{Browser, BrowserFactory, ViewportSize};
use crate::error::BridgeError;

use super::frame::{Frame, FrameStore};
use super::session::{SessionEvent, ViewSession};
use super::subscribe::{SharedRegistry, Subscriber, SubscriptionRegistry};

/// Path-segment encoding: reserve everything outside unreserved characters,
/// matching the `url`-encoded `viewId` the WS `frame` message and HTTP
/// route both use.
const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'?').add(b'#').add(b' ').add(b'%');

fn encode_view_id(view_id: &str) -> String {
    utf8_percent_encode(view_id, PATH_SEGMENT).to_string()
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<ViewSession>>,
    /// Slots claimed mid-admission, before the session object lands in
    /// `sessions`. Expire on their own so a caller that never finishes
    /// admitting doesn't permanently waste capacity.
    reservations: HashMap<String, Instant>,
}

fn prune_reservations(inner: &mut Inner) {
    let now = Instant::now();
    inner.reservations.retain(|_, expiry| *expiry > now);
}

/// Owns the lazily-launched browser, every view's [`ViewSession`], the
/// frame store, and the subscription registry. The single admission point
/// for "make this view active" — `ensure_session` is where the
/// `max_active_views` cap and its reservation-based race protection live.
pub struct RendererPool {
    config: Config,
    factory: Arc<dyn BrowserFactory>,
    browser: Mutex<Option<Arc<dyn Browser>>>,
    inner: Mutex<Inner>,
    frame_store: Arc<FrameStore>,
    registry: SharedRegistry,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    last_any_active: Mutex<Option<Instant>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl RendererPool {
    pub fn new(
        config: Config,
        factory: Arc<dyn BrowserFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            factory,
            browser: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
            frame_store: Arc::new(FrameStore::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            waiters: Mutex::new(HashMap::new()),
            last_any_active: Mutex::new(Some(Instant::now())),
            events_tx,
        });
        (pool, events_rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn frame_store(&self) -> Arc<FrameStore> {
        self.frame_store.clone()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Spawn the fan-out task (publishes frames, resolves cold-start
    /// waiters, notifies WS subscribers) and the 1 Hz maintenance loop.
    pub fn spawn_background_tasks(self: &Arc<Self>, events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let fan_out = self.clone();
        tokio::spawn(async move { fan_out.run_fan_out(events_rx).await });
        let maintenance = self.clone();
        tokio::spawn(async move { maintenance.run_maintenance().await });
    }

    async fn run_fan_out(&self, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Frame { view_id, frame } => {
                    self.frame_store.publish(&view_id, frame.clone()).await;
                    self.resolve_waiters(&view_id).await;
                    let url = format!("/frame/{}.png", encode_view_id(&view_id));
                    self.registry
                        .fan_out(
                            &view_id,
                            json!({
                                "type": "frame",
                                "viewId": view_id,
                                "etag": frame.etag.to_string(),
                                "ts": frame.ts,
                                "url": url,
                            }),
                        )
                        .await;
                }
            }
        }
    }

    async fn resolve_waiters(&self, view_id: &str) {
        if let Some(txs) = self.waiters.lock().await.remove(view_id) {
            for tx in txs {
                let _ = tx.send(());
            }
        }
    }

    async fn run_maintenance(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.maintenance_tick().await;
        }
    }

    async fn maintenance_tick(&self) {
        let browser = self.current_browser().await;
        let ids: Vec<String> = self.inner.lock().await.sessions.keys().cloned().collect();

        let mut any_wanted = false;
        for id in &ids {
            let session = self.inner.lock().await.sessions.get(id).cloned();
            let Some(session) = session else { continue };
            session
                .tick(browser.as_ref(), self.config.close_page_after_inactive_ms)
                .await;

            if session.is_wanted().await {
                any_wanted = true;
            } else if !session.has_page().await {
                self.inner.lock().await.sessions.remove(id);
                session.stop().await;
            }
        }

        if any_wanted {
            *self.last_any_active.lock().await = Some(Instant::now());
        } else if browser.is_some() {
            let idle_ms = self
                .last_any_active
                .lock()
                .await
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(u64::MAX);
            if idle_ms >= self.config.close_browser_after_inactive_ms {
                info!("closing idle browser");
                let mut guard = self.browser.lock().await;
                if let Some(b) = guard.take() {
                    let _ = b.close().await;
                }
            }
        }
    }

    async fn current_browser(&self) -> Option<Arc<dyn Browser>> {
        self.browser.lock().await.clone()
    }

    async fn ensure_browser(&self) -> Result<Arc<dyn Browser>, BridgeError> {
        let mut guard = self.browser.lock().await;
        if let Some(b) = guard.as_ref() {
            return Ok(b.clone());
        }
        match self.factory.launch().await {
            Ok(b) => {
                *guard = Some(b.clone());
                Ok(b)
            }
            Err(e) => {
                warn!(error = %e, "failed to launch browser");
                Err(BridgeError::RendererNotReady)
            }
        }
    }

    /// Admit `view_id`: return its session if one is already active, else
    /// reserve a capacity slot and create one. Unknown view ids are
    /// rejected before any reservation accounting happens.
    async fn ensure_session(&self, view_id: &str) -> Result<Arc<ViewSession>, BridgeError> {
        let view_config = self
            .config
            .view(view_id)
            .filter(|v| v.enabled)
            .cloned()
            .ok_or(BridgeError::UnknownView)?;

        let mut inner = self.inner.lock().await;
        prune_reservations(&mut inner);

        if let Some(session) = inner.sessions.get(view_id) {
            return Ok(session.clone());
        }

        if !inner.reservations.contains_key(view_id) {
            let candidates: Vec<(String, Arc<ViewSession>)> = inner
                .sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect();
            // Invariant 2: a session merely resident in the map is not
            // necessarily "active" — it may be cooling down, past its
            // subscriber/HTTP activity grace period but not yet reaped by
            // the maintenance tick. Count only sessions `wanted()` actually
            // considers live, so a view that already went quiet doesn't
            // keep occupying a capacity slot it no longer needs.
            let mut active_views = wanted_ids(candidates).await;
            active_views.extend(inner.reservations.keys().cloned());

            if active_views.len() >= self.config.max_active_views {
                return Err(BridgeError::TooManyActiveViews {
                    limit: self.config.max_active_views,
                    active_views,
                    requested: view_id.to_string(),
                });
            }
            inner.reservations.insert(
                view_id.to_string(),
                Instant::now() + Duration::from_millis(RESERVATION_TTL_MS),
            );
        }

        let viewport = ViewportSize {
            width: self.config.canvas_width,
            height: self.config.canvas_height,
        };
        let session = ViewSession::new(
            view_config,
            self.config.cache_bust_on_reload,
            self.config.auto_reload_ms,
            self.config.inactive_grace_ms,
            viewport,
            self.events_tx.clone(),
        );
        inner.sessions.insert(view_id.to_string(), session.clone());
        inner.reservations.remove(view_id);
        drop(inner);

        session.start().await;
        Ok(session)
    }

    /// Run an out-of-band activation tick right after admission so the
    /// first frame doesn't have to wait for the next 1 Hz maintenance pass.
    async fn accelerate(&self, session: &Arc<ViewSession>) -> Result<(), BridgeError> {
        *self.last_any_active.lock().await = Some(Instant::now());
        let browser = self.ensure_browser().await?;
        session
            .tick(Some(&browser), self.config.close_page_after_inactive_ms)
            .await;
        Ok(())
    }

    pub async fn subscribe(&self, view_id: &str, subscriber: Subscriber) -> Result<(), BridgeError> {
        let session = self.ensure_session(view_id).await?;
        if let Some(previous) = self.registry.subscribe(subscriber, view_id).await {
            if previous != view_id {
                let prev_session = self.inner.lock().await.sessions.get(&previous).cloned();
                if let Some(prev_session) = prev_session {
                    prev_session.unsubscribe().await;
                }
            }
        }
        session.subscribe().await;
        self.accelerate(&session).await
    }

    pub async fn unsubscribe(&self, subscriber_id: u64) {
        if let Some(view_id) = self.registry.unsubscribe(subscriber_id).await {
            let session = self.inner.lock().await.sessions.get(&view_id).cloned();
            if let Some(session) = session {
                session.unsubscribe().await;
            }
        }
    }

    pub async fn touch_http(&self, view_id: &str) -> Result<Arc<ViewSession>, BridgeError> {
        let session = self.ensure_session(view_id).await?;
        session.touch_http().await;
        self.accelerate(&session).await?;
        Ok(session)
    }

    pub async fn get_frame_or_wait(&self, view_id: &str) -> Option<Frame> {
        if let Some(frame) = self.frame_store.get(view_id).await {
            return Some(frame);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(view_id.to_string())
            .or_default()
            .push(tx);
        let _ = tokio::time::timeout(Duration::from_millis(COLD_START_WAIT_MS), rx).await;
        self.frame_store.get(view_id).await
    }

    pub async fn last_error(&self, view_id: &str) -> Option<String> {
        let session = self.inner.lock().await.sessions.get(view_id).cloned();
        match session {
            Some(s) => s.last_error().await,
            None => None,
        }
    }

    /// View-ids the pool currently considers active per Invariant 2 — not
    /// merely the set of session objects still resident in memory.
    pub async fn active_view_ids(&self) -> Vec<String> {
        let candidates: Vec<(String, Arc<ViewSession>)> = self
            .inner
            .lock()
            .await
            .sessions
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        wanted_ids(candidates).await
    }
}

/// Filters `(view_id, session)` pairs down to the ones whose session is
/// currently `wanted()` (Invariant 2: subscribers > 0, or recent HTTP/
/// activity within the grace period). Takes owned clones rather than a
/// reference so callers can release the `inner` map lock before awaiting
/// each session's own state lock.
async fn wanted_ids(candidates: Vec<(String, Arc<ViewSession>)>) -> Vec<String> {
    let mut ids = Vec::with_capacity(candidates.len());
    for (id, session) in candidates {
        if session.is_wanted().await {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewConfig;
    use crate::error::DriverError;
    use async_trait::async_trait;

    struct NeverLaunches;
    #[async_trait]
    impl BrowserFactory for NeverLaunches {
        async fn launch(&self) -> Result<Arc<dyn Browser>, DriverError> {
            Err(DriverError::Launch("no chrome in tests".into()))
        }
    }

    fn test_config(max_active_views: usize, ids: &[&str]) -> Config {
        let views = ids
            .iter()
            .map(|id| ViewConfig {
                id: id.to_string(),
                url: format!("http://example.invalid/{id}"),
                enabled: true,
                name: None,
                busy_fps: 10,
                capture_min_interval_ms: 200,
                capture_max_interval_ms: 2000,
            })
            .collect();
        Config {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8787,
            auth_token: None,
            canvas_width: 384,
            canvas_height: 64,
            capture_min_interval_ms: 200,
            capture_max_interval_ms: 2000,
            auto_reload_ms: 0,
            cache_bust_on_reload: false,
            default_view: None,
            max_active_views,
            inactive_grace_ms: 5000,
            close_page_after_inactive_ms: 15_000,
            close_browser_after_inactive_ms: 30_000,
            views,
        }
    }

    #[tokio::test]
    async fn unknown_view_is_rejected_before_consuming_capacity() {
        let config = test_config(1, &["a"]);
        let (pool, _rx) = RendererPool::new(config, Arc::new(NeverLaunches));
        let err = pool.ensure_session("nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownView));
    }

    #[tokio::test]
    async fn admission_rejects_beyond_cap() {
        let config = test_config(1, &["a", "b"]);
        let (pool, _rx) = RendererPool::new(config, Arc::new(NeverLaunches));
        let session_a = pool.ensure_session("a").await.unwrap();
        session_a.touch_http().await;
        let err = pool.ensure_session("b").await.unwrap_err();
        assert!(matches!(err, BridgeError::TooManyActiveViews { .. }));
    }

    #[tokio::test]
    async fn reactivating_an_already_active_view_does_not_need_capacity() {
        let config = test_config(1, &["a"]);
        let (pool, _rx) = RendererPool::new(config, Arc::new(NeverLaunches));
        let session_a = pool.ensure_session("a").await.unwrap();
        session_a.touch_http().await;
        pool.ensure_session("a").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_view_is_rejected_like_unknown() {
        let mut config = test_config(1, &["a"]);
        config.views[0].enabled = false;
        let (pool, _rx) = RendererPool::new(config, Arc::new(NeverLaunches));
        let err = pool.ensure_session("a").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownView));
    }

    /// S3-style: a fresh pool with no browser running serves a frame once
    /// admitted and given a moment for the fan-out task to publish it.
    #[tokio::test]
    async fn touch_http_cold_start_eventually_yields_a_frame() {
        use crate::driver::fake::FakeBrowserFactory;

        let config = test_config(1, &["a"]);
        let (factory, _browser) = FakeBrowserFactory::new();
        let (pool, events_rx) = RendererPool::new(config, Arc::new(factory));
        pool.spawn_background_tasks(events_rx);

        pool.touch_http("a").await.unwrap();
        let frame = pool.get_frame_or_wait("a").await;
        assert!(frame.is_some());
        assert_eq!(frame.unwrap().etag.len(), 42);
    }

    /// S2-style: admission is rejected before any session/page is created,
    /// and the rejection reports the already-active view ids.
    #[tokio::test]
    async fn third_subscribe_over_cap_reports_active_views() {
        let config = test_config(2, &["a", "b", "c"]);
        let (pool, _rx) = RendererPool::new(config, Arc::new(NeverLaunches));
        let session_a = pool.ensure_session("a").await.unwrap();
        session_a.touch_http().await;
        let session_b = pool.ensure_session("b").await.unwrap();
        session_b.touch_http().await;
        let err = pool.ensure_session("c").await.unwrap_err();
        match err {
            BridgeError::TooManyActiveViews {
                limit,
                mut active_views,
                requested,
            } => {
                active_views.sort();
                assert_eq!(limit, 2);
                assert_eq!(active_views, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(requested, "c");
            }
            other => panic!("expected TooManyActiveViews, got {other:?}"),
        }
    }
}
