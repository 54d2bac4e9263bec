//! Anti-bot challenge detection and the cooldown/rotate protocol.

use crate::browser::{ProxyRotation, SessionManager};
use crate::error::BrowserError;
use std::time::Duration;
use tracing::{info, warn};

/// Lowercase phrases that only appear on challenge pages.
const CHALLENGE_MARKERS: &[&str] = &[
    "unusual traffic",
    "/sorry/index",
    "captcha",
    "vui lòng xác minh",
    "xác minh rằng bạn không phải là robot",
];

const MIN_COOLDOWN: Duration = Duration::from_secs(45);
const MAX_COOLDOWN: Duration = Duration::from_secs(180);

/// Classification of a loaded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Clear,
    Challenged,
}

/// What the caller should do after a page has been inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeAction {
    /// Page is usable.
    Proceed,
    /// Abandon the current item.
    Skip,
    /// Cooldown and rotation done; load the same URL again.
    Retry,
}

/// Classifies a page from its title and raw markup.
///
/// Markers are matched against the whole source, so text inside tags and
/// attributes (form actions, script URLs) counts as well.
pub fn classify(title: &str, html: &str) -> PageStatus {
    let title = title.to_lowercase();
    if title.contains("google") && title.contains("sorry") {
        return PageStatus::Challenged;
    }

    let markup = html.to_lowercase();
    let matches = |needle: &str| markup.contains(needle);
    if CHALLENGE_MARKERS.iter().any(|m| matches(m)) || (matches("verify") && matches("robot")) {
        PageStatus::Challenged
    } else {
        PageStatus::Clear
    }
}

/// Cooldown for a base setting: one fifth of it, clamped to 45s..=180s.
pub fn cooldown_for(base: Duration) -> Duration {
    (base / 5).clamp(MIN_COOLDOWN, MAX_COOLDOWN)
}

/// Drives detect, wait, rotate and retry. Never tries to solve a challenge.
pub struct ChallengeHandler {
    skip: bool,
    cooldown: Duration,
    rotation: ProxyRotation,
    consecutive: u32,
    longest: u32,
    total: u32,
}

impl ChallengeHandler {
    pub fn new(base_cooldown: Duration, skip: bool, rotation: ProxyRotation) -> Self {
        Self { skip, cooldown: cooldown_for(base_cooldown), rotation, consecutive: 0, longest: 0, total: 0 }
    }

    /// Time slept on each challenge.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Challenges seen since the last clear page.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Longest run of challenges without a clear page in between.
    pub fn longest_streak(&self) -> u32 {
        self.longest
    }

    /// Challenges seen over the whole run.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Proxy chosen for the first session.
    pub fn initial_proxy(&mut self) -> Option<String> {
        self.rotation.next_proxy()
    }

    /// Inspects the page currently loaded in `sessions` and reacts to it.
    pub async fn check(&mut self, sessions: &mut SessionManager) -> Result<ChallengeAction, BrowserError> {
        let session = sessions.ensure_session().await?;
        let title = session.title().await?;
        let html = session.source().await?;
        self.handle(classify(&title, &html), sessions).await
    }

    /// Applies the protocol for an already classified page.
    pub async fn handle(&mut self, status: PageStatus, sessions: &mut SessionManager) -> Result<ChallengeAction, BrowserError> {
        if status == PageStatus::Clear {
            self.consecutive = 0;
            return Ok(ChallengeAction::Proceed);
        }

        self.total += 1;
        self.consecutive += 1;
        self.longest = self.longest.max(self.consecutive);
        if self.skip {
            warn!("Challenge page detected ({} in a row), skipping item", self.consecutive);
            return Ok(ChallengeAction::Skip);
        }

        warn!(
            "Challenge page detected ({} in a row), cooling down {}s",
            self.consecutive,
            self.cooldown.as_secs()
        );
        tokio::time::sleep(self.cooldown).await;

        let proxy = self.rotation.next_proxy();
        info!("Rotating session (proxy: {})", proxy.as_deref().unwrap_or("none"));
        sessions.recreate(proxy).await?;

        Ok(ChallengeAction::Retry)
    }
}
