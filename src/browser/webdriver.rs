//! WebDriver backend built on fantoccini, talking to a running chromedriver.

use super::{BrowserSession, SessionFactory};
use crate::config::BrowserSettings;
use crate::error::BrowserError;
use async_trait::async_trait;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::wd::{Capabilities, TimeoutConfiguration};
use fantoccini::{Client, ClientBuilder, Locator};
use rand::seq::IndexedRandom;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Desktop user agents; one is picked per session.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

fn random_user_agent() -> &'static str {
    USER_AGENTS.choose(&mut rand::rng()).copied().unwrap_or(USER_AGENTS[0])
}

/// Maps a fantoccini command error onto the session taxonomy.
fn classify(err: CmdError) -> BrowserError {
    match &err {
        CmdError::Standard(wd) => match wd.error {
            ErrorStatus::InvalidSessionId | ErrorStatus::NoSuchWindow | ErrorStatus::SessionNotCreated => {
                BrowserError::SessionBroken(err.to_string())
            }
            ErrorStatus::Timeout | ErrorStatus::ScriptTimeout => BrowserError::Timeout(err.to_string()),
            _ => BrowserError::from_message(err.to_string()),
        },
        CmdError::Lost(_) => BrowserError::SessionBroken(err.to_string()),
        CmdError::WaitTimeout => BrowserError::Timeout(err.to_string()),
        _ => BrowserError::from_message(err.to_string()),
    }
}

/// True for "nothing matched in time", which callers treat as absence.
fn is_absent(err: &CmdError) -> bool {
    match err {
        CmdError::WaitTimeout => true,
        CmdError::Standard(wd) => matches!(wd.error, ErrorStatus::NoSuchElement),
        _ => false,
    }
}

/// Builds chromedriver sessions from [`BrowserSettings`].
pub struct WebDriverFactory {
    settings: BrowserSettings,
}

impl WebDriverFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    /// Chrome command-line arguments for one session.
    pub fn chrome_args(&self, proxy: Option<&str>, user_agent: &str) -> Vec<String> {
        let settings = &self.settings;
        let window = settings.window_size.replace('x', ",");
        let profile = settings.cache_dir.join("chrome-profile");
        let disk_cache = settings.cache_dir.join("disk-cache");

        let mut args = vec![
            format!("--window-size={}", window),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("--lang={}", settings.language),
            format!("--user-data-dir={}", profile.display()),
            "--profile-directory=Default".to_string(),
            format!("--disk-cache-dir={}", disk_cache.display()),
            "--use-gl=swiftshader".to_string(),
            "--disable-gpu".to_string(),
            format!("--user-agent={}", user_agent),
        ];

        if settings.headless {
            args.push("--headless=new".to_string());
        }

        if let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
            args.push(format!("--proxy-server={}", proxy));
        }

        args
    }

    /// W3C capabilities requesting Chrome with an eager page-load strategy.
    pub fn capabilities(&self, proxy: Option<&str>) -> Capabilities {
        let mut chrome = json!({ "args": self.chrome_args(proxy, random_user_agent()) });
        if let Some(binary) = &self.settings.binary {
            chrome["binary"] = json!(binary);
        }

        let mut caps = Capabilities::new();
        caps.insert("browserName".to_string(), json!("chrome"));
        caps.insert("pageLoadStrategy".to_string(), json!("eager"));
        caps.insert("goog:chromeOptions".to_string(), chrome);
        caps
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn create(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError> {
        if let Err(e) = std::fs::create_dir_all(&self.settings.cache_dir) {
            debug!("Could not create cache dir {}: {}", self.settings.cache_dir.display(), e);
        }

        let client = ClientBuilder::native()
            .capabilities(self.capabilities(proxy))
            .connect(&self.settings.webdriver_url)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let page_load = Duration::from_secs(self.settings.page_load_timeout_secs);
        client
            .update_timeouts(TimeoutConfiguration::new(None, Some(page_load), None))
            .await
            .map_err(classify)?;

        info!("WebDriver session started via {}", self.settings.webdriver_url);
        Ok(Box::new(WebDriverSession { client }))
    }
}

/// A live chromedriver session.
pub struct WebDriverSession {
    client: Client,
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        debug!("Navigating to {}", url);
        self.client.goto(url).await.map_err(classify)
    }

    async fn title(&self) -> Result<String, BrowserError> {
        self.client.title().await.map_err(classify)
    }

    async fn source(&self) -> Result<String, BrowserError> {
        self.client.source().await.map_err(classify)
    }

    async fn wait_for_attribute(&self, css: &str, attribute: &str, timeout: Duration) -> Result<Option<String>, BrowserError> {
        let element = match self.client.wait().at_most(timeout).for_element(Locator::Css(css)).await {
            Ok(element) => element,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(classify(e)),
        };

        let value = element.attr(attribute).await.map_err(classify)?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }

    async fn click(&self, css: &str, timeout: Duration) -> Result<bool, BrowserError> {
        let element = match self.client.wait().at_most(timeout).for_element(Locator::Css(css)).await {
            Ok(element) => element,
            Err(e) if is_absent(&e) => return Ok(false),
            Err(e) => return Err(classify(e)),
        };

        element.click().await.map_err(classify)?;
        Ok(true)
    }

    async fn attributes(&self, css: &str, attribute: &str) -> Result<Vec<String>, BrowserError> {
        let elements = self.client.find_all(Locator::Css(css)).await.map_err(classify)?;

        let mut values = Vec::with_capacity(elements.len());
        for element in elements {
            if let Some(value) = element.attr(attribute).await.map_err(classify)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.client.close().await.map_err(classify)
    }
}
