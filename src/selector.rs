//! Keyset-paginated stream of records missing a field.

use crate::error::StoreError;
use crate::store::{PendingItem, StoreRepository, TargetField};
use std::sync::Arc;
use tracing::debug;

/// Pages through pending records in ascending identity order.
///
/// The cursor only moves forward. It lives in memory, so a restarted run
/// begins again from the lowest pending identity.
pub struct WorkSelector {
    store: Arc<dyn StoreRepository>,
    field: TargetField,
    batch_size: usize,
    cursor: i64,
}

impl WorkSelector {
    pub fn new(store: Arc<dyn StoreRepository>, field: TargetField, batch_size: usize) -> Self {
        Self { store, field, batch_size: batch_size.max(1), cursor: 0 }
    }

    /// Starts after `cursor` instead of from the beginning.
    pub fn starting_after(mut self, cursor: i64) -> Self {
        self.cursor = cursor;
        self
    }

    /// Identity of the last attempted item.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn field(&self) -> TargetField {
        self.field
    }

    /// Number of records currently pending, regardless of the cursor.
    pub async fn count_pending(&self) -> Result<u64, StoreError> {
        self.store.count_pending(self.field).await
    }

    /// Fetches the next page after the cursor; empty once the queue is drained.
    pub async fn next_page(&self) -> Result<Vec<PendingItem>, StoreError> {
        self.page(self.batch_size).await
    }

    /// Fetches at most `size` items after the cursor.
    pub async fn page(&self, size: usize) -> Result<Vec<PendingItem>, StoreError> {
        let items = self.store.pending_after(self.field, self.cursor, size).await?;
        debug!("Selected {} pending items after id={}", items.len(), self.cursor);
        Ok(items)
    }

    /// Marks `id` as attempted. Never moves the cursor backwards.
    pub fn advance(&mut self, id: i64) {
        if id > self.cursor {
            self.cursor = id;
        }
    }
}
