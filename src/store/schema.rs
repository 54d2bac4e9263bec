//! Idempotent DDL for the store and progress tables.
//!
//! Every statement can run any number of times. Steps that need PostGIS are
//! optional: when the extension is missing they are skipped and the store
//! keeps working without the derived geometry column.

/// Table holding one row per physical store.
pub const STORES_TABLE: &str = "grocery_stores";

/// Table holding discovery progress per (province, district, keyword).
pub const PROGRESS_TABLE: &str = "crawl_progress";

/// One schema step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub name: &'static str,
    pub sql: &'static str,
    /// Failure is logged and skipped instead of aborting startup.
    pub optional: bool,
}

const fn required(name: &'static str, sql: &'static str) -> Step {
    Step { name, sql, optional: false }
}

const fn optional(name: &'static str, sql: &'static str) -> Step {
    Step { name, sql, optional: true }
}

/// Steps that do not depend on PostGIS.
pub const BASE_STEPS: &[Step] = &[
    required(
        "create stores table",
        r#"
        CREATE TABLE IF NOT EXISTS grocery_stores (
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
            address TEXT,
            map_url TEXT,
            created_at TIMESTAMP DEFAULT NOW()
        )
        "#,
    ),
    required(
        "create progress table",
        r#"
        CREATE TABLE IF NOT EXISTS crawl_progress (
            province TEXT NOT NULL,
            district TEXT NOT NULL,
            keyword TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            last_place_id TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT NOW(),
            CONSTRAINT crawl_progress_pk PRIMARY KEY (province, district, keyword)
        )
        "#,
    ),
    required("add address column", "ALTER TABLE grocery_stores ADD COLUMN IF NOT EXISTS address TEXT"),
    required("add map_url column", "ALTER TABLE grocery_stores ADD COLUMN IF NOT EXISTS map_url TEXT"),
    required(
        "add last_place_id column",
        "ALTER TABLE crawl_progress ADD COLUMN IF NOT EXISTS last_place_id TEXT",
    ),
    required(
        "add status column",
        "ALTER TABLE crawl_progress ADD COLUMN IF NOT EXISTS status TEXT NOT NULL DEFAULT 'pending'",
    ),
    required(
        "add updated_at column",
        "ALTER TABLE crawl_progress ADD COLUMN IF NOT EXISTS updated_at TIMESTAMP NOT NULL DEFAULT NOW()",
    ),
    required("index province", "CREATE INDEX IF NOT EXISTS idx_gs_province ON grocery_stores (province)"),
    required("index district", "CREATE INDEX IF NOT EXISTS idx_gs_district ON grocery_stores (district)"),
    required(
        "index coordinates",
        "CREATE INDEX IF NOT EXISTS idx_gs_latlng ON grocery_stores (latitude, longitude)",
    ),
];

/// Steps that install the derived geometry column. The chain stops at the
/// first failure.
pub const GEOMETRY_COLUMN_STEPS: &[Step] = &[
    optional("enable postgis", "CREATE EXTENSION IF NOT EXISTS postgis"),
    optional(
        "add geom column",
        "ALTER TABLE grocery_stores ADD COLUMN IF NOT EXISTS geom geometry(Point, 4326)",
    ),
];

/// Steps that keep the geometry column in sync. Only run once the column exists.
pub const GEOMETRY_SYNC_STEPS: &[Step] = &[
    optional(
        "index geom",
        "CREATE INDEX IF NOT EXISTS idx_gs_geom ON grocery_stores USING GIST (geom)",
    ),
    optional(
        "geometry trigger function",
        r#"
        CREATE OR REPLACE FUNCTION set_geom_from_latlon()
        RETURNS trigger AS $$
        BEGIN
          IF NEW.longitude IS NOT NULL AND NEW.latitude IS NOT NULL THEN
            NEW.geom := ST_SetSRID(ST_MakePoint(NEW.longitude, NEW.latitude), 4326);
          ELSE
            NEW.geom := NULL;
          END IF;
          RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#,
    ),
    DROP_GEOMETRY_TRIGGER,
    optional(
        "create trigger",
        r#"
        CREATE TRIGGER trg_set_geom
        BEFORE INSERT OR UPDATE OF latitude, longitude
        ON grocery_stores
        FOR EACH ROW
        EXECUTE FUNCTION set_geom_from_latlon()
        "#,
    ),
];

/// A trigger left by an earlier install would fail every write once the
/// column is gone, so it is dropped whenever geometry is unavailable.
const DROP_GEOMETRY_TRIGGER: Step =
    optional("drop old trigger", "DROP TRIGGER IF EXISTS trg_set_geom ON grocery_stores");

const GEOMETRY_CLEANUP_STEPS: &[Step] = &[DROP_GEOMETRY_TRIGGER];

/// Steps to run after the column check: sync when present, cleanup otherwise.
pub fn geometry_sync_steps(column_present: bool) -> &'static [Step] {
    if column_present {
        GEOMETRY_SYNC_STEPS
    } else {
        GEOMETRY_CLEANUP_STEPS
    }
}

/// Checks whether the geometry column is present.
pub const GEOMETRY_COLUMN_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = 'grocery_stores'
          AND column_name = 'geom'
    )
"#;

/// Fills the geometry of rows written before the trigger existed.
pub const BACKFILL_GEOMETRY: &str = r#"
    UPDATE grocery_stores
    SET geom = ST_SetSRID(ST_MakePoint(longitude, latitude), 4326)
    WHERE geom IS NULL
      AND longitude IS NOT NULL
      AND latitude IS NOT NULL
"#;
