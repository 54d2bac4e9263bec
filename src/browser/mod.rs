//! Browser automation: session traits, the WebDriver backend, session
//! lifecycle and proxy rotation.

pub mod proxy;
pub mod session;
pub mod webdriver;

use crate::error::BrowserError;
use async_trait::async_trait;
use std::time::Duration;

pub use proxy::ProxyRotation;
pub use session::{SessionManager, SessionPolicy};
pub use webdriver::{WebDriverFactory, WebDriverSession};

/// A live browser session - enables mocking for tests.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Loads a URL and waits for the page-load strategy to settle.
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Returns the current document title.
    async fn title(&self) -> Result<String, BrowserError>;

    /// Returns the current page markup.
    async fn source(&self) -> Result<String, BrowserError>;

    /// Waits up to `timeout` for an element matching `css` and reads one attribute.
    ///
    /// Returns `Ok(None)` if the element never appears or lacks the attribute.
    async fn wait_for_attribute(&self, css: &str, attribute: &str, timeout: Duration) -> Result<Option<String>, BrowserError>;

    /// Waits up to `timeout` for a clickable element matching `css` and clicks it.
    ///
    /// Returns `Ok(false)` if no such element appeared.
    async fn click(&self, css: &str, timeout: Duration) -> Result<bool, BrowserError>;

    /// Reads `attribute` from every element matching `css`, skipping elements without it.
    async fn attributes(&self, css: &str, attribute: &str) -> Result<Vec<String>, BrowserError>;

    /// Ends the session and releases the browser.
    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

/// Creates browser sessions, optionally routed through a proxy.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError>;
}
