//! Image extraction strategies for place detail pages.
//!
//! Update the selectors here when the detail page layout changes.

use super::ExtractionStrategy;
use crate::browser::BrowserSession;
use crate::error::BrowserError;
use async_trait::async_trait;
use regex_lite::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Preview image meta tag.
pub const META_IMAGE: &str = r#"meta[property="og:image"]"#;

/// Controls that open the photo viewer, tried in order.
pub const PHOTO_CONTROLS: &[&str] = &[
    r#"button[jsaction*="pane.heroHeaderImage"]"#,
    r#"button[aria-label*="Photo"]"#,
    r#"button[aria-label*="Hình ảnh"]"#,
];

/// Host fragment of the photo CDN.
pub const PHOTO_CDN: &str = "googleusercontent.com";

/// Image URLs on the photo CDN, Street View or the Maps static API.
pub static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)https?://(?:lh\d\.googleusercontent\.com|streetviewpixels[^"']+|maps\.googleapis\.com[^"']+)[^"']+"#,
    )
    .unwrap()
});

/// First image URL in a chunk of markup.
pub fn scan_markup(html: &str) -> Option<String> {
    IMAGE_URL.find(html).map(|m| m.as_str().to_string())
}

/// Reads the `content` of the preview image meta tag.
#[derive(Debug, Clone)]
pub struct MetaImage {
    pub wait: Duration,
}

impl Default for MetaImage {
    fn default() -> Self {
        Self { wait: Duration::from_secs(15) }
    }
}

#[async_trait]
impl ExtractionStrategy for MetaImage {
    fn name(&self) -> &'static str {
        "meta-image"
    }

    fn timeout(&self) -> Duration {
        self.wait + Duration::from_secs(2)
    }

    async fn extract(&self, session: &dyn BrowserSession) -> Result<Option<String>, BrowserError> {
        session.wait_for_attribute(META_IMAGE, "content", self.wait).await
    }
}

/// Opens the photo viewer and picks the first image served from the photo CDN.
#[derive(Debug, Clone)]
pub struct PhotoControl {
    /// Wait for each control to become clickable.
    pub wait: Duration,
    /// Pause after the click for images to load.
    pub settle: Duration,
}

impl Default for PhotoControl {
    fn default() -> Self {
        Self { wait: Duration::from_secs(8), settle: Duration::from_millis(1600) }
    }
}

#[async_trait]
impl ExtractionStrategy for PhotoControl {
    fn name(&self) -> &'static str {
        "photo-control"
    }

    fn timeout(&self) -> Duration {
        (self.wait + self.settle) * PHOTO_CONTROLS.len() as u32 + Duration::from_secs(2)
    }

    async fn extract(&self, session: &dyn BrowserSession) -> Result<Option<String>, BrowserError> {
        for css in PHOTO_CONTROLS {
            match session.click(css, self.wait).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("Photo control '{}' failed: {}", css, e);
                    continue;
                }
            }

            tokio::time::sleep(self.settle).await;

            let sources = session.attributes("img", "src").await?;
            if let Some(src) = sources.into_iter().find(|src| src.contains(PHOTO_CDN)) {
                return Ok(Some(src));
            }
        }
        Ok(None)
    }
}

/// Searches the raw page markup for an image URL.
#[derive(Debug, Clone)]
pub struct MarkupScan {
    pub budget: Duration,
}

impl Default for MarkupScan {
    fn default() -> Self {
        Self { budget: Duration::from_secs(10) }
    }
}

#[async_trait]
impl ExtractionStrategy for MarkupScan {
    fn name(&self) -> &'static str {
        "markup-scan"
    }

    fn timeout(&self) -> Duration {
        self.budget
    }

    async fn extract(&self, session: &dyn BrowserSession) -> Result<Option<String>, BrowserError> {
        let html = session.source().await?;
        Ok(scan_markup(&html))
    }
}
