//! Error taxonomy shared by the store, browser and config layers.
//!
//! Transient classes (`Contention`, `SessionBroken`) are handled by the
//! lowest component able to act on them. Only configuration and resource
//! initialisation failures are fatal to a run.

use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

/// PostgreSQL SQLSTATE codes that mean "could not get the lock or finish in time".
pub mod sqlstate {
    /// lock_not_available, raised by `NOWAIT` and `lock_timeout`.
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    /// query_canceled, raised by `statement_timeout`.
    pub const QUERY_CANCELED: &str = "57014";
    /// deadlock_detected.
    pub const DEADLOCK_DETECTED: &str = "40P01";

    /// Returns true if the code is a lock/timeout condition.
    pub fn is_contention(code: &str) -> bool {
        matches!(code, LOCK_NOT_AVAILABLE | QUERY_CANCELED | DEADLOCK_DETECTED)
    }
}

/// Message fragments used when a driver gives no structured code.
const CONTENTION_PATTERNS: &[&str] =
    &["could not obtain lock", "lock timeout", "statement timeout", "canceling statement"];

/// Errors raised by the store repository.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row lock not acquired immediately, or the statement ran out of time.
    #[error("database contention: {0}")]
    Contention(String),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Schema installation failed on a required (non-optional) step.
    #[error("schema error: {0}")]
    Schema(String),

    /// Connection settings are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// Returns true for the contention class.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            let code = db_err.code().unwrap_or(Cow::Borrowed(""));
            if sqlstate::is_contention(&code) {
                return StoreError::Contention(db_err.message().to_string());
            }
        }

        match err {
            sqlx::Error::PoolTimedOut => StoreError::Contention("connection pool timed out".into()),
            other => {
                let message = other.to_string().to_lowercase();
                if CONTENTION_PATTERNS.iter().any(|p| message.contains(p)) {
                    StoreError::Contention(other.to_string())
                } else {
                    StoreError::Database(other)
                }
            }
        }
    }
}

/// Errors raised by a browser session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    /// The automation session itself is unusable and must be replaced.
    #[error("browser session broken: {0}")]
    SessionBroken(String),

    /// The page or element did not become ready in time.
    #[error("browser timeout: {0}")]
    Timeout(String),

    /// A command failed for a page-level reason.
    #[error("browser command failed: {0}")]
    Command(String),

    /// The session could not be created.
    #[error("failed to start browser session: {0}")]
    Launch(String),
}

/// Message fragments that identify a dead session.
const SESSION_BROKEN_PATTERNS: &[&str] = &[
    "no such window",
    "web view not found",
    "disconnected:",
    "not connected to devtools",
    "invalid session id",
    "chrome not reachable",
];

impl BrowserError {
    /// Returns true if recreating the session can help.
    pub fn is_session_broken(&self) -> bool {
        matches!(self, BrowserError::SessionBroken(_))
    }

    /// Classifies a free-form driver message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if looks_session_broken(&message) {
            BrowserError::SessionBroken(message)
        } else if message.to_lowercase().contains("timeout") {
            BrowserError::Timeout(message)
        } else {
            BrowserError::Command(message)
        }
    }
}

/// Pattern fallback for drivers that only expose message text.
pub fn looks_session_broken(message: &str) -> bool {
    let message = message.to_lowercase();
    SESSION_BROKEN_PATTERNS.iter().any(|p| message.contains(p))
}

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing database settings: set DATABASE_URL or PGDATABASE, PGUSER and PGPASSWORD")]
    MissingDatabase,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read proxy list {}: {source}", path.display())]
    ProxyList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
