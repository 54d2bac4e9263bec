//! Owns the single live browser session and recreates it when it dies.

use super::{BrowserSession, SessionFactory};
use crate::error::BrowserError;
use crate::retry::jitter;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How aggressively a dead session is replaced during one navigation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionPolicy {
    /// Recreations allowed per `navigate` call.
    pub max_recreate: u32,
    /// Wait after the first recreation.
    pub recreate_delay: Duration,
    /// Extra wait added per further recreation.
    pub recreate_step: Duration,
    /// Upper bound of the random jitter added to each wait.
    pub jitter: Duration,
}

impl SessionPolicy {
    pub fn new(max_recreate: u32) -> Self {
        Self {
            max_recreate,
            recreate_delay: Duration::from_millis(600),
            recreate_step: Duration::from_millis(300),
            jitter: Duration::from_millis(200),
        }
    }

    /// No waiting between recreations.
    pub fn immediate(max_recreate: u32) -> Self {
        Self { max_recreate, recreate_delay: Duration::ZERO, recreate_step: Duration::ZERO, jitter: Duration::ZERO }
    }

    fn wait_for(&self, recreation: u32) -> Duration {
        self.recreate_delay + self.recreate_step * recreation.saturating_sub(1) + jitter(self.jitter)
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Holds at most one browser session.
pub struct SessionManager {
    factory: Box<dyn SessionFactory>,
    session: Option<Box<dyn BrowserSession>>,
    proxy: Option<String>,
    policy: SessionPolicy,
    sessions_created: u32,
}

impl SessionManager {
    /// Creates a manager; no session is started until the first navigation.
    pub fn new(factory: Box<dyn SessionFactory>, proxy: Option<String>, policy: SessionPolicy) -> Self {
        Self { factory, session: None, proxy, policy, sessions_created: 0 }
    }

    /// Proxy used for the next session.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Changes the proxy used by the next session. The live session keeps its proxy.
    pub fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    /// Returns true if a session is live.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Number of sessions created so far.
    pub fn sessions_created(&self) -> u32 {
        self.sessions_created
    }

    /// Returns the live session, creating one if needed.
    pub async fn ensure_session(&mut self) -> Result<&dyn BrowserSession, BrowserError> {
        if self.session.is_none() {
            debug!("Starting browser session (proxy: {})", self.proxy.as_deref().unwrap_or("none"));
            let session = self.factory.create(self.proxy.as_deref()).await?;
            self.session = Some(session);
            self.sessions_created += 1;
        }

        self.session.as_deref().ok_or_else(|| BrowserError::Launch("session unavailable".into()))
    }

    /// Loads `url`, replacing the session if it turns out to be dead.
    ///
    /// Only session-broken failures trigger recreation, bounded by the policy.
    /// Other failures, and the last session-broken failure once the bound is
    /// reached, are returned to the caller.
    pub async fn navigate(&mut self, url: &str) -> Result<&dyn BrowserSession, BrowserError> {
        let mut recreations = 0;

        loop {
            let result = self.ensure_session().await?.goto(url).await;
            match result {
                Ok(()) => break,
                Err(e) if e.is_session_broken() && recreations < self.policy.max_recreate => {
                    recreations += 1;
                    warn!(
                        "Browser session broken ('{}'), recreating ({}/{})",
                        e, recreations, self.policy.max_recreate
                    );
                    self.discard().await;
                    self.ensure_session().await?;

                    let wait = self.policy.wait_for(recreations);
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.ensure_session().await
    }

    /// Replaces the live session with a fresh one, optionally on another proxy.
    pub async fn recreate(&mut self, proxy: Option<String>) -> Result<(), BrowserError> {
        self.discard().await;
        self.proxy = proxy;
        self.ensure_session().await?;
        info!("Browser session recreated (proxy: {})", self.proxy.as_deref().unwrap_or("none"));
        Ok(())
    }

    /// Releases the live session, if any. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.session.is_some() {
            self.discard().await;
            info!("Browser session closed");
        }
    }

    async fn discard(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!("Ignoring error while closing session: {}", e);
            }
        }
    }
}
