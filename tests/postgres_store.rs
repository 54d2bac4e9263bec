//! Repository properties against a live Postgres.
//!
//! Skipped unless DATABASE_URL points at a disposable database.

use gmaps_backfill::config::Config;
use gmaps_backfill::store::schema::STORES_TABLE;
use gmaps_backfill::store::{
    FieldUpdate, PgStoreRepository, StorePayload, StoreRepository, TargetField, UpsertOutcome,
};
use gmaps_backfill::StoreError;
use sqlx::postgres::PgPoolOptions;
use std::time::{Duration, Instant};

async fn connect() -> Option<(PgStoreRepository, Config)> {
    dotenvy::dotenv().ok();
    let config = Config::default().with_env();
    if config.database.url.is_none() {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    }

    let store = PgStoreRepository::connect(&config.database).await.unwrap();
    store.ensure_schema().await.unwrap();
    Some((store, config))
}

/// Place id unique to this test run.
fn unique(tag: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("test-{}-{}", tag, nanos)
}

#[tokio::test]
async fn test_upsert_twice_keeps_one_record() {
    let Some((store, _)) = connect().await else { return };
    let place_id = unique("upsert");

    let first = StorePayload::new(&place_id, "Tạp hóa Minh").with_region("Hà Nội", "Ba Đình");
    assert_eq!(store.upsert_entity(&first).await.unwrap(), UpsertOutcome::Inserted);

    let mut second = first.clone();
    second.name = Some("Tạp hóa Minh Anh".into());
    second.phone = Some("0901234567".into());
    assert!(store.upsert_entity(&second).await.unwrap().is_changed());
    assert_eq!(store.upsert_entity(&second).await.unwrap(), UpsertOutcome::Unchanged);

    let record = store.lookup_by_identifier(&place_id).await.unwrap().unwrap();
    assert_eq!(record.name.as_deref(), Some("Tạp hóa Minh Anh"));
    assert_eq!(record.phone.as_deref(), Some("0901234567"));

    store.close().await;
}

#[tokio::test]
async fn test_geometry_follows_coordinates() {
    let Some((store, _)) = connect().await else { return };
    if !store.geometry_enabled() {
        eprintln!("PostGIS not available, skipping");
        store.close().await;
        return;
    }
    let place_id = unique("geom");

    let payload = StorePayload::new(&place_id, "Tạp hóa Lan").with_coordinates(10.7769, 106.7009);
    store.upsert_entity(&payload).await.unwrap();

    let record = store.lookup_by_identifier(&place_id).await.unwrap().unwrap();
    let point = record.geometry.unwrap();
    assert!((point.latitude - 10.7769).abs() < 1e-9);
    assert!((point.longitude - 106.7009).abs() < 1e-9);

    let mut moved = payload.clone();
    moved.longitude = None;
    store.upsert_entity(&moved).await.unwrap();

    let record = store.lookup_by_identifier(&place_id).await.unwrap().unwrap();
    assert!(record.geometry.is_none());

    store.close().await;
}

#[tokio::test]
async fn test_sentinel_identifiers_create_separate_records() {
    let Some((store, config)) = connect().await else { return };
    let name = unique("sentinel");

    store.upsert_entity(&StorePayload::new("N/A", &name)).await.unwrap();
    store.upsert_entity(&StorePayload::new("", &name)).await.unwrap();
    assert!(store.lookup_by_identifier("N/A").await.unwrap().is_none());

    let pool = PgPoolOptions::new().max_connections(1).connect_with(config.database.connect_options().unwrap()).await.unwrap();
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE name = $1", STORES_TABLE))
        .bind(&name)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    pool.close().await;
    store.close().await;
}

#[tokio::test]
async fn test_pending_pages_are_ordered_and_complete() {
    let Some((store, _)) = connect().await else { return };

    let mut ids = Vec::new();
    for i in 0..5 {
        let place_id = unique(&format!("page{}", i));
        store.upsert_entity(&StorePayload::new(&place_id, "Tạp hóa")).await.unwrap();
        ids.push(store.lookup_by_identifier(&place_id).await.unwrap().unwrap().id);
    }

    let start = ids[0] - 1;
    let mut cursor = start;
    let mut seen = Vec::new();
    loop {
        let page = store.pending_after(TargetField::Image, cursor, 2).await.unwrap();
        assert!(page.len() <= 2);
        if page.is_empty() {
            break;
        }
        let mut previous = cursor;
        for item in &page {
            assert!(item.id > previous);
            previous = item.id;
            seen.push(item.id);
        }
        cursor = previous;
    }

    for id in &ids {
        assert_eq!(seen.iter().filter(|s| *s == id).count(), 1, "id {}", id);
    }

    store.close().await;
}

#[tokio::test]
async fn test_update_on_locked_row_reports_contention() {
    let Some((store, config)) = connect().await else { return };
    let place_id = unique("lock");
    store.upsert_entity(&StorePayload::new(&place_id, "Tạp hóa")).await.unwrap();
    let id = store.lookup_by_identifier(&place_id).await.unwrap().unwrap().id;

    let holder = PgPoolOptions::new().max_connections(1).connect_with(config.database.connect_options().unwrap()).await.unwrap();
    let mut tx = holder.begin().await.unwrap();
    sqlx::query(&format!("SELECT 1 FROM {} WHERE id = $1 FOR UPDATE", STORES_TABLE))
        .bind(id)
        .execute(&mut *tx)
        .await
        .unwrap();

    let started = Instant::now();
    let result = store.update_field(id, TargetField::Image, "https://lh3.googleusercontent.com/p/x").await;
    assert!(matches!(result, Err(StoreError::Contention(_))), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_millis(config.database.lock_timeout_ms) + Duration::from_secs(2));

    tx.rollback().await.unwrap();
    holder.close().await;

    let outcome = store.update_field(id, TargetField::Image, "https://lh3.googleusercontent.com/p/x").await.unwrap();
    assert_eq!(outcome, FieldUpdate::Updated);

    store.close().await;
}

#[tokio::test]
async fn test_schema_install_twice_keeps_writes_working() {
    let Some((store, _)) = connect().await else { return };
    let first = store.ensure_schema().await.unwrap();
    let second = store.ensure_schema().await.unwrap();
    assert_eq!(first.geometry_enabled, second.geometry_enabled);

    let place_id = unique("reinstall");
    store.upsert_entity(&StorePayload::new(&place_id, "Tạp hóa").with_coordinates(21.03, 105.85)).await.unwrap();
    let id = store.lookup_by_identifier(&place_id).await.unwrap().unwrap().id;
    let outcome = store.update_field(id, TargetField::Image, "https://lh3.googleusercontent.com/p/y").await.unwrap();
    assert_eq!(outcome, FieldUpdate::Updated);

    store.close().await;
}

#[tokio::test]
async fn test_writes_succeed_when_geometry_is_unavailable() {
    let Some((admin, config)) = connect().await else { return };
    admin.close().await;

    // A fresh schema first on the search path: the PostGIS types in `public` are not
    // visible, so the geometry column cannot be added there.
    let namespace = unique("nogeom").replace('-', "_");
    let options = config.database.connect_options().unwrap();
    let setup = PgPoolOptions::new().max_connections(1).connect_with(options.clone()).await.unwrap();
    sqlx::raw_sql(&format!(
        r#"
        CREATE SCHEMA {ns};
        CREATE TABLE {ns}.grocery_stores (
            id SERIAL PRIMARY KEY,
            province TEXT,
            district TEXT,
            place_id TEXT UNIQUE,
            name TEXT,
            image TEXT,
            rating TEXT,
            category TEXT,
            status TEXT,
            closing_time TEXT,
            phone TEXT,
            latitude DOUBLE PRECISION,
            longitude DOUBLE PRECISION,
            created_at TIMESTAMP DEFAULT NOW()
        );
        CREATE FUNCTION {ns}.set_geom_from_latlon() RETURNS trigger AS $$
        BEGIN
          NEW.geom := NULL;
          RETURN NEW;
        END;
        $$ LANGUAGE plpgsql;
        CREATE TRIGGER trg_set_geom BEFORE INSERT OR UPDATE ON {ns}.grocery_stores
          FOR EACH ROW EXECUTE FUNCTION {ns}.set_geom_from_latlon();
        "#,
        ns = namespace
    ))
    .execute(&setup)
    .await
    .unwrap();

    let scoped = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options.options([("search_path", namespace.as_str())]))
        .await
        .unwrap();
    let store = PgStoreRepository::from_pool(scoped).await;
    let report = store.ensure_schema().await.unwrap();
    assert_eq!(report.geometry_enabled, store.geometry_enabled());

    let place_id = unique("nogeom");
    let payload = StorePayload::new(&place_id, "Tạp hóa Hoa").with_coordinates(16.06, 108.22);
    assert_eq!(store.upsert_entity(&payload).await.unwrap(), UpsertOutcome::Inserted);
    let record = store.lookup_by_identifier(&place_id).await.unwrap().unwrap();
    if !report.geometry_enabled {
        assert!(record.geometry.is_none());
    }
    let outcome = store.update_field(record.id, TargetField::Image, "https://lh3.googleusercontent.com/p/z").await.unwrap();
    assert_eq!(outcome, FieldUpdate::Updated);

    store.close().await;
    sqlx::raw_sql(&format!("DROP SCHEMA {} CASCADE", namespace)).execute(&setup).await.unwrap();
    setup.close().await;
}

#[tokio::test]
async fn test_blank_place_id_is_never_pending() {
    let Some((store, config)) = connect().await else { return };
    let pool = PgPoolOptions::new().max_connections(1).connect_with(config.database.connect_options().unwrap()).await.unwrap();
    let name = unique("blank");

    let id: i64 = sqlx::query_scalar(&format!(
        "INSERT INTO {} (place_id, name) VALUES ('   ', $1) RETURNING id::BIGINT",
        STORES_TABLE
    ))
    .bind(&name)
    .fetch_one(&pool)
    .await
    .unwrap();

    let page = store.pending_after(TargetField::Image, id - 1, 1).await.unwrap();
    assert!(page.iter().all(|item| item.id != id));

    sqlx::query(&format!("DELETE FROM {} WHERE id = $1", STORES_TABLE)).bind(id).execute(&pool).await.unwrap();
    pool.close().await;
    store.close().await;
}
