//! Round-robin proxy rotation.

use crate::error::ConfigError;
use std::path::Path;
use tracing::{debug, warn};

/// Rotates through a proxy list; falls back to a single proxy, or none.
#[derive(Debug, Clone, Default)]
pub struct ProxyRotation {
    proxies: Vec<String>,
    fallback: Option<String>,
    index: Option<usize>,
}

impl ProxyRotation {
    /// Creates a rotation over `proxies`, using `fallback` when the list is empty.
    pub fn new(proxies: Vec<String>, fallback: Option<String>) -> Self {
        let fallback = fallback.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        Self { proxies, fallback, index: None }
    }

    /// Creates a rotation that never uses a proxy.
    pub fn none() -> Self {
        Self::default()
    }

    /// Reads one proxy per line, ignoring blank lines and `#` comments.
    pub fn load_list(path: &Path) -> Result<Vec<String>, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ProxyList { path: path.to_path_buf(), source })?;

        let proxies: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();

        debug!("Loaded {} proxies from {}", proxies.len(), path.display());
        Ok(proxies)
    }

    /// Builds the rotation from config, logging (not failing) on an unreadable list.
    pub fn from_settings(list: Option<&Path>, single: Option<String>) -> Self {
        let proxies = match list {
            Some(path) => Self::load_list(path).unwrap_or_else(|e| {
                warn!("{}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        Self::new(proxies, single)
    }

    /// Advances to the next proxy and returns it.
    pub fn next_proxy(&mut self) -> Option<String> {
        if self.proxies.is_empty() {
            return self.fallback.clone();
        }

        let next = match self.index {
            Some(i) => (i + 1) % self.proxies.len(),
            None => 0,
        };
        self.index = Some(next);
        Some(self.proxies[next].clone())
    }

    /// Proxy most recently returned by [`next_proxy`](Self::next_proxy).
    pub fn current(&self) -> Option<&str> {
        match self.index {
            Some(i) => self.proxies.get(i).map(String::as_str),
            None => self.fallback.as_deref(),
        }
    }

    /// Number of proxies in the rotation list.
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// Returns true if no proxy list is configured.
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
