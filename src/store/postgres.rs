//! Postgres-backed store repository.

use super::models::{
    GeoPoint, PendingItem, PlaceId, ProgressRecord, ProgressStatus, ProvinceStats, StorePayload,
    StoreRecord, TargetField, NOT_AVAILABLE,
};
use super::schema::{self, Step, PROGRESS_TABLE, STORES_TABLE};
use super::{FieldUpdate, SchemaReport, StoreRepository, UpsertOutcome};
use crate::config::DatabaseSettings;
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const RECORD_COLUMNS: &str = "id::BIGINT AS id, province, district, place_id, name, image, rating, \
     category, status, closing_time, phone, latitude, longitude, address, map_url, created_at";

/// Store repository over a single Postgres connection.
pub struct PgStoreRepository {
    pool: PgPool,
    geometry: AtomicBool,
}

impl PgStoreRepository {
    /// Connects with the session timeouts from `settings`.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let options = settings.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        info!("Connected to Postgres");
        Ok(Self::from_pool(pool).await)
    }

    /// Wraps an existing pool, detecting whether the geometry column exists.
    pub async fn from_pool(pool: PgPool) -> Self {
        let repo = Self { pool, geometry: AtomicBool::new(false) };
        let enabled = repo.detect_geometry().await.unwrap_or(false);
        repo.geometry.store(enabled, Ordering::Relaxed);
        repo
    }

    /// Returns true if the derived geometry column is in use.
    pub fn geometry_enabled(&self) -> bool {
        self.geometry.load(Ordering::Relaxed)
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Postgres pool closed");
    }

    async fn detect_geometry(&self) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(schema::GEOMETRY_COLUMN_EXISTS).fetch_one(&self.pool).await?;
        Ok(exists)
    }

    async fn run_step(&self, step: &Step) -> Result<(), sqlx::Error> {
        debug!("Schema step: {}", step.name);
        sqlx::raw_sql(step.sql).execute(&self.pool).await.map(|_| ())
    }

    fn record_select(&self) -> String {
        let geometry = if self.geometry_enabled() {
            "ST_X(geom) AS geom_x, ST_Y(geom) AS geom_y, ST_SRID(geom) AS geom_srid"
        } else {
            "NULL::FLOAT8 AS geom_x, NULL::FLOAT8 AS geom_y, NULL::INT4 AS geom_srid"
        };
        format!("SELECT {}, {} FROM {}", RECORD_COLUMNS, geometry, STORES_TABLE)
    }

    fn upsert_sql(&self) -> String {
        let (geom_column, geom_value, geom_update) = if self.geometry_enabled() {
            (
                ", geom",
                ", CASE WHEN $12::FLOAT8 IS NOT NULL AND $11::FLOAT8 IS NOT NULL \
                   THEN ST_SetSRID(ST_MakePoint($12, $11), 4326) ELSE NULL END",
                ", geom = EXCLUDED.geom",
            )
        } else {
            ("", "", "")
        };

        format!(
            r#"
            INSERT INTO {table} (
                province, district, place_id, name, image, rating, category,
                status, closing_time, phone, latitude, longitude,
                address, map_url, created_at{geom_column}
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                COALESCE($15, LOCALTIMESTAMP){geom_value}
            )
            ON CONFLICT (place_id) DO UPDATE SET
                province = EXCLUDED.province,
                district = EXCLUDED.district,
                name = EXCLUDED.name,
                image = EXCLUDED.image,
                rating = EXCLUDED.rating,
                category = EXCLUDED.category,
                status = EXCLUDED.status,
                closing_time = EXCLUDED.closing_time,
                phone = EXCLUDED.phone,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                address = EXCLUDED.address,
                map_url = EXCLUDED.map_url{geom_update}
            WHERE (
                {table}.province, {table}.district, {table}.name, {table}.image, {table}.rating,
                {table}.category, {table}.status, {table}.closing_time, {table}.phone,
                {table}.latitude, {table}.longitude, {table}.address, {table}.map_url
            ) IS DISTINCT FROM (
                EXCLUDED.province, EXCLUDED.district, EXCLUDED.name, EXCLUDED.image, EXCLUDED.rating,
                EXCLUDED.category, EXCLUDED.status, EXCLUDED.closing_time, EXCLUDED.phone,
                EXCLUDED.latitude, EXCLUDED.longitude, EXCLUDED.address, EXCLUDED.map_url
            )
            RETURNING (xmax = 0) AS inserted
            "#,
            table = STORES_TABLE,
        )
    }
}

/// Predicate matching rows whose `column` is missing and whose place id is usable.
fn pending_predicate(field: TargetField) -> String {
    let column = field.column();
    format!(
        "({col} IS NULL OR {col} = '' OR {col} = '{na}') \
         AND place_id IS NOT NULL AND btrim(place_id) NOT IN ('', '{na}')",
        col = column,
        na = NOT_AVAILABLE,
    )
}

fn record_from_row(row: &PgRow) -> Result<StoreRecord, sqlx::Error> {
    let geom_x: Option<f64> = row.try_get("geom_x")?;
    let geom_y: Option<f64> = row.try_get("geom_y")?;
    let geom_srid: Option<i32> = row.try_get("geom_srid")?;

    let geometry = match (geom_x, geom_y) {
        (Some(longitude), Some(latitude)) => Some(GeoPoint {
            longitude,
            latitude,
            srid: geom_srid.unwrap_or(super::models::SRID_WGS84),
        }),
        _ => None,
    };

    Ok(StoreRecord {
        id: row.try_get("id")?,
        province: row.try_get("province")?,
        district: row.try_get("district")?,
        place_id: row.try_get("place_id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        rating: row.try_get("rating")?,
        category: row.try_get("category")?,
        status: row.try_get("status")?,
        closing_time: row.try_get("closing_time")?,
        phone: row.try_get("phone")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        address: row.try_get("address")?,
        map_url: row.try_get("map_url")?,
        geometry,
        created_at: row.try_get("created_at")?,
    })
}

fn progress_from_row(row: &PgRow) -> Result<ProgressRecord, sqlx::Error> {
    let raw_status: String = row.try_get("status")?;
    let status = raw_status.parse().unwrap_or_else(|e| {
        warn!("{}; treating as pending", e);
        ProgressStatus::Pending
    });

    Ok(ProgressRecord {
        province: row.try_get("province")?,
        district: row.try_get("district")?,
        keyword: row.try_get("keyword")?,
        status,
        last_place_id: row.try_get("last_place_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StoreRepository for PgStoreRepository {
    async fn ensure_schema(&self) -> Result<SchemaReport, StoreError> {
        let mut report = SchemaReport::default();

        for step in schema::BASE_STEPS {
            self.run_step(step)
                .await
                .map_err(|e| StoreError::Schema(format!("{}: {}", step.name, e)))?;
        }

        for step in schema::GEOMETRY_COLUMN_STEPS {
            if let Err(e) = self.run_step(step).await {
                warn!("Skipping optional schema step '{}': {}", step.name, e);
                report.skipped_steps += 1;
                break;
            }
        }

        let enabled = self.detect_geometry().await.unwrap_or(false);
        if !enabled {
            debug!("Geometry column missing, removing any sync trigger");
        }
        for step in schema::geometry_sync_steps(enabled) {
            if let Err(e) = self.run_step(step).await {
                warn!("Skipping optional schema step '{}': {}", step.name, e);
                report.skipped_steps += 1;
            }
        }

        self.geometry.store(enabled, Ordering::Relaxed);
        report.geometry_enabled = enabled;

        info!(
            "Schema ready (geometry: {}, skipped optional steps: {})",
            if enabled { "on" } else { "off" },
            report.skipped_steps
        );
        Ok(report)
    }

    async fn backfill_geometry(&self) -> Result<u64, StoreError> {
        if !self.geometry_enabled() {
            debug!("Geometry column not installed, nothing to backfill");
            return Ok(0);
        }

        let result = sqlx::query(schema::BACKFILL_GEOMETRY).execute(&self.pool).await?;
        info!("Backfilled geometry for {} rows", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn upsert_entity(&self, payload: &StorePayload) -> Result<UpsertOutcome, StoreError> {
        let sql = self.upsert_sql();
        let created_at = payload.created_at.map(|t| t.naive_utc());

        let inserted: Option<bool> = sqlx::query_scalar(&sql)
            .bind(&payload.province)
            .bind(&payload.district)
            .bind(payload.usable_place_id())
            .bind(&payload.name)
            .bind(&payload.image)
            .bind(&payload.rating)
            .bind(&payload.category)
            .bind(&payload.status)
            .bind(&payload.closing_time)
            .bind(&payload.phone)
            .bind(payload.latitude)
            .bind(payload.longitude)
            .bind(&payload.address)
            .bind(&payload.map_url)
            .bind(created_at)
            .fetch_optional(&self.pool)
            .await?;

        let outcome = match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Unchanged,
        };
        debug!("Upsert place_id={:?}: {:?}", payload.usable_place_id(), outcome);
        Ok(outcome)
    }

    async fn lookup_by_identifier(&self, place_id: &str) -> Result<Option<StoreRecord>, StoreError> {
        let Some(place_id) = PlaceId::normalize(place_id) else {
            return Ok(None);
        };

        let sql = format!("{} WHERE place_id = $1", self.record_select());
        let row = sqlx::query(&sql).bind(place_id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn get(&self, id: i64) -> Result<Option<StoreRecord>, StoreError> {
        let sql = format!("{} WHERE id = $1", self.record_select());
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn update_field(&self, id: i64, field: TargetField, value: &str) -> Result<FieldUpdate, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Fails immediately with 55P03 if another session holds the row.
        let lock_sql = format!("SELECT 1 FROM {} WHERE id = $1 FOR UPDATE NOWAIT", STORES_TABLE);
        let locked: Option<i32> = sqlx::query_scalar(&lock_sql).bind(id).fetch_optional(&mut *tx).await?;

        if locked.is_none() {
            tx.rollback().await?;
            warn!("UPDATE skipped, id={} does not exist", id);
            return Ok(FieldUpdate::NotFound);
        }

        let update_sql = format!("UPDATE {} SET {} = $1 WHERE id = $2", STORES_TABLE, field.column());
        sqlx::query(&update_sql).bind(value).bind(id).execute(&mut *tx).await?;
        tx.commit().await?;

        info!("UPDATE ok id={} {} (len={})", id, field, value.len());
        Ok(FieldUpdate::Updated)
    }

    async fn count_pending(&self, field: TargetField) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", STORES_TABLE, pending_predicate(field));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_after(&self, field: TargetField, after_id: i64, limit: usize) -> Result<Vec<PendingItem>, StoreError> {
        let sql = format!(
            "SELECT id::BIGINT AS id, place_id FROM {} WHERE {} AND id > $1 ORDER BY id LIMIT $2",
            STORES_TABLE,
            pending_predicate(field)
        );

        let items = sqlx::query_as::<_, PendingItem>(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn list_progress(&self, status: Option<ProgressStatus>) -> Result<Vec<ProgressRecord>, StoreError> {
        let base = format!(
            "SELECT province, district, keyword, status, last_place_id, updated_at FROM {}",
            PROGRESS_TABLE
        );

        let rows = match status {
            Some(status) => {
                let sql = format!("{} WHERE status = $1 ORDER BY province, district, keyword", base);
                sqlx::query(&sql).bind(status.as_str()).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!("{} ORDER BY province, district, keyword", base);
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        Ok(rows.iter().map(progress_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn province_stats(&self) -> Result<Vec<ProvinceStats>, StoreError> {
        let with_geometry = if self.geometry_enabled() {
            "COUNT(*) FILTER (WHERE geom IS NOT NULL)"
        } else {
            "0::BIGINT"
        };

        let sql = format!(
            r#"
            SELECT
                COALESCE(province, '(unknown)') AS province,
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE image IS NOT NULL AND image <> '' AND image <> '{na}') AS with_image,
                COUNT(*) FILTER (WHERE image IS NULL OR image = '' OR image = '{na}') AS missing_image,
                {with_geometry} AS with_geometry
            FROM {table}
            GROUP BY 1
            ORDER BY total DESC, province
            "#,
            na = NOT_AVAILABLE,
            with_geometry = with_geometry,
            table = STORES_TABLE,
        );

        let stats = sqlx::query_as::<_, ProvinceStats>(&sql).fetch_all(&self.pool).await?;
        Ok(stats)
    }
}
