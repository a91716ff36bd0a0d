//! In-memory [`Browser`]/[`Page`] fake used by render-layer tests so the
//! session loop and pool admission logic can be exercised without spawning
//! a real Chrome process. No CDP, no subprocess — just the same trait
//! boundary the real `chrome` module implements.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::DriverError;
use crate::render::scripts;

use super::{Browser, BrowserFactory, Page, ViewportSize};

/// The knobs a test uses to drive one page's behavior after it has been
/// handed off to a session loop.
pub struct FakePageScript {
    dirty: AtomicBool,
    png: StdMutex<Vec<u8>>,
    pub screenshot_calls: AtomicU32,
    pub fail_screenshot: AtomicBool,
}

impl FakePageScript {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dirty: AtomicBool::new(true),
            png: StdMutex::new(vec![0u8, 1, 2, 3]),
            screenshot_calls: AtomicU32::new(0),
            fail_screenshot: AtomicBool::new(false),
        })
    }

    pub fn set_png(&self, png: Vec<u8>) {
        *self.png.lock().unwrap() = png;
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

/// A fake browser that hands out [`FakePage`]s and records them so a test
/// can reach back in and mutate a specific page's screenshot/dirty state.
#[derive(Default)]
pub struct FakeBrowser {
    pages: StdMutex<Vec<Arc<FakePageScript>>>,
    pub closed: AtomicBool,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn nth_page(&self, index: usize) -> Arc<FakePageScript> {
        self.pages.lock().unwrap()[index].clone()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self, _viewport: ViewportSize) -> Result<Box<dyn Page>, DriverError> {
        let script = FakePageScript::new();
        self.pages.lock().unwrap().push(script.clone());
        Ok(Box::new(FakePage {
            script,
            current_url: None,
        }))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePage {
    script: Arc<FakePageScript>,
    current_url: Option<String>,
}

#[async_trait]
impl Page for FakePage {
    fn current_url(&self) -> Option<String> {
        self.current_url.clone()
    }

    async fn set_init_script(&mut self, _script: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<(), DriverError> {
        self.current_url = Some(url.to_string());
        Ok(())
    }

    async fn reload(&mut self, _timeout_ms: u64) -> Result<(), DriverError> {
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value, DriverError> {
        if expression == scripts::MARK_DIRTY_JS {
            self.script.mark_dirty();
            return Ok(json!({"result": {"value": true}}));
        }
        // CONSUME_DIRTY_JS: read-and-clear.
        let was = self.script.dirty.swap(false, Ordering::SeqCst);
        Ok(json!({"result": {"value": was}}))
    }

    async fn evaluate_async(&mut self, _expression: &str) -> Result<Value, DriverError> {
        Ok(json!({"result": {"value": true}}))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        self.script.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_screenshot.load(Ordering::SeqCst) {
            return Err(DriverError::Screenshot("forced failure".into()));
        }
        Ok(self.script.png.lock().unwrap().clone())
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Hands out a single shared [`FakeBrowser`] on every `launch()`, matching
/// how the real pool only ever launches one browser at a time.
pub struct FakeBrowserFactory {
    pub browser: Arc<FakeBrowser>,
}

impl FakeBrowserFactory {
    pub fn new() -> (Self, Arc<FakeBrowser>) {
        let browser = FakeBrowser::new();
        (
            Self {
                browser: browser.clone(),
            },
            browser,
        )
    }
}

#[async_trait]
impl BrowserFactory for FakeBrowserFactory {
    async fn launch(&self) -> Result<Arc<dyn Browser>, DriverError> {
        Ok(self.browser.clone())
    }
}
