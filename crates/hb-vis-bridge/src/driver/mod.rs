//! The browser-driver capability boundary.
//!
//! The rendering pool and view sessions never speak CDP directly — they go
//! through [`Browser`] and [`Page`]. [`chrome`] is the concrete realization
//! (a hand-rolled CDP-over-WebSocket client driving a real headless Chrome
//! process); tests substitute an in-memory fake that implements the same
//! traits without spawning a browser.

pub mod chrome;
mod connection;
#[cfg(test)]
pub mod fake;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Factory for a browser instance. Exists as its own trait (rather than a
/// bare `launch()` associated function) so the pool can hold `Arc<dyn
/// BrowserFactory>` and swap in a fake for tests.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>, DriverError>;
}

/// A running browser instance. Owns zero or more pages.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self, viewport: ViewportSize) -> Result<Box<dyn Page>, DriverError>;

    /// Close the browser. Implementations must tolerate being called after
    /// pages were already dropped without being explicitly closed.
    async fn close(&self) -> Result<(), DriverError>;
}

/// A single open page/tab. Exclusively owned by one view session's capture
/// loop — never shared or accessed concurrently, so methods take `&mut self`.
#[async_trait]
pub trait Page: Send {
    fn current_url(&self) -> Option<String>;

    /// Install a script that runs on every document creation, on this page,
    /// from here on (CDP `Page.addScriptToEvaluateOnNewDocument` semantics).
    async fn set_init_script(&mut self, script: &str) -> Result<(), DriverError>;

    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<(), DriverError>;

    async fn reload(&mut self, timeout_ms: u64) -> Result<(), DriverError>;

    /// Evaluate a synchronous expression, returning its value.
    async fn evaluate(&mut self, expression: &str) -> Result<serde_json::Value, DriverError>;

    /// Evaluate an expression and await its promise (used for the paint
    /// debounce's nested-rAF wait).
    async fn evaluate_async(&mut self, expression: &str) -> Result<serde_json::Value, DriverError>;

    /// Screenshot the page as PNG. Implementations should disable
    /// animations and hide the caret first when possible, falling back to
    /// a plain screenshot otherwise.
    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError>;

    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}
