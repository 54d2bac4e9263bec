//! Store maintenance commands: schema installation and reports.

use crate::config::Config;
use crate::format::Formatter;
use crate::store::{PgStoreRepository, ProgressStatus, StoreRepository};
use anyhow::{Context, Result};

/// Executes schema setup and read-only store reports.
pub struct MaintenanceCommand {
    config: Config,
}

impl MaintenanceCommand {
    /// Creates a new maintenance command.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Installs the schema and fills missing geometry.
    pub async fn init_schema(&self) -> Result<String> {
        let store = self.connect().await?;
        let result = self.init_schema_with(&store).await;
        store.close().await;
        result
    }

    /// Installs the schema with a provided store (for testing).
    pub async fn init_schema_with(&self, store: &dyn StoreRepository) -> Result<String> {
        let report = store.ensure_schema().await.context("Failed to install schema")?;
        let filled = store.backfill_geometry().await.context("Failed to backfill geometry")?;

        let geometry = if report.geometry_enabled { "enabled" } else { "disabled (PostGIS unavailable)" };
        let mut lines = vec!["Schema ready.".to_string(), format!("Geometry: {}", geometry)];
        if report.geometry_enabled {
            lines.push(format!("Geometry filled for {} records", filled));
        }
        if report.skipped_steps > 0 {
            lines.push(format!("Skipped {} optional steps", report.skipped_steps));
        }
        Ok(lines.join("\n"))
    }

    /// Reports per-province coverage.
    pub async fn stats(&self) -> Result<String> {
        let store = self.connect().await?;
        let result = self.stats_with(&store).await;
        store.close().await;
        result
    }

    /// Reports coverage with a provided store (for testing).
    pub async fn stats_with(&self, store: &dyn StoreRepository) -> Result<String> {
        let stats = store.province_stats().await.context("Failed to read store statistics")?;
        Ok(Formatter::new(self.config.format).format_stats(&stats))
    }

    /// Lists discovery progress, optionally filtered by status.
    pub async fn progress(&self, status: Option<ProgressStatus>) -> Result<String> {
        let store = self.connect().await?;
        let result = self.progress_with(&store, status).await;
        store.close().await;
        result
    }

    /// Lists progress with a provided store (for testing).
    pub async fn progress_with(&self, store: &dyn StoreRepository, status: Option<ProgressStatus>) -> Result<String> {
        let records = store.list_progress(status).await.context("Failed to read progress records")?;
        Ok(Formatter::new(self.config.format).format_progress(&records))
    }

    async fn connect(&self) -> Result<PgStoreRepository> {
        PgStoreRepository::connect(&self.config.database)
            .await
            .context("Failed to connect to Postgres")
    }
}
