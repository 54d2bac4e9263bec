//! gmaps-backfill - resilient crawl-and-persist pipeline for Google Maps store records
//!
//! Revisits place detail pages in a real browser, survives bot challenges and
//! dead sessions, and fills missing fields in a Postgres/PostGIS store.

pub mod browser;
pub mod challenge;
pub mod commands;
pub mod config;
pub mod error;
pub mod extract;
pub mod format;
pub mod progress;
pub mod retry;
pub mod selector;
pub mod store;

pub use config::Config;
pub use error::{BrowserError, ConfigError, StoreError};
pub use store::{StorePayload, StoreRecord, StoreRepository, TargetField};
