//! In-process store repository with the same invariants as the Postgres one.
//!
//! Used by dry runs without a database and by tests.

use super::models::{
    PendingItem, PlaceId, ProgressRecord, ProgressStatus, ProvinceStats, StorePayload, StoreRecord,
    TargetField,
};
use super::{FieldUpdate, SchemaReport, StoreRepository, UpsertOutcome};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<i64, StoreRecord>,
    by_place_id: HashMap<String, i64>,
    progress: Vec<ProgressRecord>,
    locked: BTreeSet<i64>,
    next_id: i64,
}

/// Store repository held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulates another session holding the row lock on `id`.
    pub fn lock_row(&self, id: i64) {
        self.state().locked.insert(id);
    }

    /// Releases a lock taken with [`lock_row`](Self::lock_row).
    pub fn unlock_row(&self, id: i64) {
        self.state().locked.remove(&id);
    }

    /// Removes a record, as a concurrent cleanup would.
    pub fn remove(&self, id: i64) -> Option<StoreRecord> {
        let mut state = self.state();
        let record = state.records.remove(&id)?;
        if let Some(place_id) = &record.place_id {
            state.by_place_id.remove(place_id);
        }
        Some(record)
    }

    /// Adds or replaces a discovery progress record.
    pub fn put_progress(&self, record: ProgressRecord) {
        let mut state = self.state();
        state.progress.retain(|p| {
            (&p.province, &p.district, &p.keyword) != (&record.province, &record.district, &record.keyword)
        });
        state.progress.push(record);
    }

    /// Snapshot of every record in identity order.
    pub fn records(&self) -> Vec<StoreRecord> {
        self.state().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }
}

#[async_trait]
impl StoreRepository for MemoryStore {
    async fn ensure_schema(&self) -> Result<SchemaReport, StoreError> {
        Ok(SchemaReport { geometry_enabled: true, skipped_steps: 0 })
    }

    async fn backfill_geometry(&self) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut touched = 0;
        for record in state.records.values_mut() {
            if record.geometry.is_none() {
                if let Some(point) = super::GeoPoint::derive(record.latitude, record.longitude) {
                    record.geometry = Some(point);
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn upsert_entity(&self, payload: &StorePayload) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state();

        let existing = payload.usable_place_id().and_then(|pid| state.by_place_id.get(pid).copied());
        if let Some(id) = existing {
            if state.locked.contains(&id) {
                return Err(StoreError::Contention(format!("row {} is locked", id)));
            }
            let changed = state.records.get_mut(&id).is_some_and(|record| record.apply(payload));
            return Ok(if changed { UpsertOutcome::Updated } else { UpsertOutcome::Unchanged });
        }

        state.next_id += 1;
        let id = state.next_id;
        let record = StoreRecord::from_payload(id, payload);
        if let Some(place_id) = &record.place_id {
            state.by_place_id.insert(place_id.clone(), id);
        }
        state.records.insert(id, record);
        debug!("Inserted record id={}", id);
        Ok(UpsertOutcome::Inserted)
    }

    async fn lookup_by_identifier(&self, place_id: &str) -> Result<Option<StoreRecord>, StoreError> {
        let Some(place_id) = PlaceId::normalize(place_id) else {
            return Ok(None);
        };
        let state = self.state();
        Ok(state.by_place_id.get(place_id).and_then(|id| state.records.get(id)).cloned())
    }

    async fn get(&self, id: i64) -> Result<Option<StoreRecord>, StoreError> {
        Ok(self.state().records.get(&id).cloned())
    }

    async fn update_field(&self, id: i64, field: TargetField, value: &str) -> Result<FieldUpdate, StoreError> {
        let mut state = self.state();
        if state.locked.contains(&id) {
            return Err(StoreError::Contention(format!("could not obtain lock on row {}", id)));
        }

        match state.records.get_mut(&id) {
            Some(record) => {
                record.set_field(field, value);
                Ok(FieldUpdate::Updated)
            }
            None => Ok(FieldUpdate::NotFound),
        }
    }

    async fn count_pending(&self, field: TargetField) -> Result<u64, StoreError> {
        Ok(self.state().records.values().filter(|r| r.is_pending(field)).count() as u64)
    }

    async fn pending_after(&self, field: TargetField, after_id: i64, limit: usize) -> Result<Vec<PendingItem>, StoreError> {
        let state = self.state();
        let items = state
            .records
            .range(after_id.saturating_add(1)..)
            .map(|(_, record)| record)
            .filter(|record| record.is_pending(field))
            .filter_map(|record| {
                record.place_id.as_ref().map(|place_id| PendingItem { id: record.id, place_id: place_id.clone() })
            })
            .take(limit)
            .collect();
        Ok(items)
    }

    async fn list_progress(&self, status: Option<ProgressStatus>) -> Result<Vec<ProgressRecord>, StoreError> {
        let mut records: Vec<ProgressRecord> = self
            .state()
            .progress
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (&a.province, &a.district, &a.keyword).cmp(&(&b.province, &b.district, &b.keyword))
        });
        Ok(records)
    }

    async fn province_stats(&self) -> Result<Vec<ProvinceStats>, StoreError> {
        let state = self.state();
        let mut by_province: BTreeMap<String, ProvinceStats> = BTreeMap::new();

        for record in state.records.values() {
            let province = record.province.clone().unwrap_or_else(|| "(unknown)".to_string());
            let stats = by_province.entry(province.clone()).or_insert_with(|| ProvinceStats {
                province,
                total: 0,
                with_image: 0,
                missing_image: 0,
                with_geometry: 0,
            });

            stats.total += 1;
            if TargetField::is_missing(record.image.as_deref()) {
                stats.missing_image += 1;
            } else {
                stats.with_image += 1;
            }
            if record.geometry.is_some() {
                stats.with_geometry += 1;
            }
        }

        let mut stats: Vec<ProvinceStats> = by_province.into_values().collect();
        stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.province.cmp(&b.province)));
        Ok(stats)
    }
}
