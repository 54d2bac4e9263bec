//! Store repository: schema, dedup, geometry derivation and lock-aware updates.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

use crate::error::StoreError;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use models::{
    GeoPoint, PendingItem, PlaceId, ProgressRecord, ProgressStatus, ProvinceStats, StorePayload,
    StoreRecord, TargetField,
};
pub use postgres::PgStoreRepository;

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created.
    Inserted,
    /// An existing row had at least one field changed.
    Updated,
    /// An existing row already matched the payload.
    Unchanged,
}

impl UpsertOutcome {
    /// Returns true if any row was created or changed.
    pub fn is_changed(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Result of a single-field update. Contention is reported as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    Updated,
    /// No row with that identity exists.
    NotFound,
}

/// Summary of a schema installation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaReport {
    /// True if the derived geometry column and its trigger are installed.
    pub geometry_enabled: bool,
    /// Optional steps that failed and were skipped.
    pub skipped_steps: usize,
}

/// Persistent store of place records.
///
/// Implementations own the uniqueness and geometry invariants; callers treat
/// records as opaque payloads.
#[async_trait]
pub trait StoreRepository: Send + Sync {
    /// Creates tables, indexes and the geometry trigger if absent. Idempotent.
    async fn ensure_schema(&self) -> Result<SchemaReport, StoreError>;

    /// Fills the geometry of rows that have both coordinates but no point.
    async fn backfill_geometry(&self) -> Result<u64, StoreError>;

    /// Inserts a record keyed by place id, or overwrites the existing one.
    async fn upsert_entity(&self, payload: &StorePayload) -> Result<UpsertOutcome, StoreError>;

    /// Finds a record by place id. Empty or sentinel ids never match.
    async fn lookup_by_identifier(&self, place_id: &str) -> Result<Option<StoreRecord>, StoreError>;

    /// Fetches a record by identity.
    async fn get(&self, id: i64) -> Result<Option<StoreRecord>, StoreError>;

    /// Sets one field on an existing record without waiting for row locks.
    ///
    /// Fails with [`StoreError::Contention`] instead of blocking. Never retries.
    async fn update_field(&self, id: i64, field: TargetField, value: &str) -> Result<FieldUpdate, StoreError>;

    /// Counts records missing `field` that have a usable place id.
    async fn count_pending(&self, field: TargetField) -> Result<u64, StoreError>;

    /// Returns up to `limit` pending records with identity strictly greater than `after_id`,
    /// in ascending identity order.
    async fn pending_after(&self, field: TargetField, after_id: i64, limit: usize) -> Result<Vec<PendingItem>, StoreError>;

    /// Lists discovery progress records, optionally filtered by status.
    async fn list_progress(&self, status: Option<ProgressStatus>) -> Result<Vec<ProgressRecord>, StoreError>;

    /// Per-province coverage of the image field and geometry.
    async fn province_stats(&self) -> Result<Vec<ProvinceStats>, StoreError>;
}
