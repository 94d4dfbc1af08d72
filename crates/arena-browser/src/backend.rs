//! The boundary between the session actor and the browser.
//!
//! The actor's bootstrap logic only ever talks to a [`BrowserBackend`], so
//! it can be exercised against a scripted fake. The production backend is
//! [`crate::cdp::CdpBackend`], produced by [`crate::cdp::CdpLauncher`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use arena_core::Result;
use arena_core::config::BrowserConfig;

/// One live browser instance, already attached to a page target.
#[async_trait]
pub trait BrowserBackend: Send {
    /// Navigate the page to `url` and wait for the load event.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Evaluate a JS expression, returning its value by value.
    async fn evaluate(&mut self, expression: &str) -> Result<Value>;

    /// Evaluate a JS expression that yields a promise, awaiting it.
    async fn evaluate_async(&mut self, expression: &str) -> Result<Value>;

    /// Cookies visible for `origin`, as name to value.
    async fn cookies(&mut self, origin: &str) -> Result<BTreeMap<String, String>>;

    /// Current rendered document HTML.
    async fn page_html(&mut self) -> Result<String>;

    /// Move the pointer to viewport coordinates.
    async fn move_pointer(&mut self, x: f64, y: f64) -> Result<()>;

    /// Left-click at viewport coordinates.
    async fn click_point(&mut self, x: f64, y: f64) -> Result<()>;

    /// Tear the browser down. Idempotent.
    async fn close(&mut self);
}

/// Produces fresh [`BrowserBackend`] instances.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a browser per `config` and attach to a page target.
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserBackend>>;
}
