//! Data models for store records, geometry and discovery progress.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel the discovery crawl writes for values it could not read.
pub const NOT_AVAILABLE: &str = "N/A";

/// Spatial reference of the derived geometry (WGS 84).
pub const SRID_WGS84: i32 = 4326;

/// Place identifier helpers.
pub struct PlaceId;

impl PlaceId {
    /// Returns the identifier if it is usable, `None` for empty or sentinel input.
    pub fn normalize(raw: &str) -> Option<&str> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == NOT_AVAILABLE {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Returns true if the identifier can be used for dedup and backfill.
    pub fn is_usable(raw: &str) -> bool {
        Self::normalize(raw).is_some()
    }
}

/// A point derived from a latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
    pub srid: i32,
}

impl GeoPoint {
    /// Derives the point; present iff both coordinates are present.
    pub fn derive(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Self { longitude, latitude, srid: SRID_WGS84 }),
            _ => None,
        }
    }
}

/// Fields the backfill pass can target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    #[default]
    Image,
    Name,
    Rating,
    Category,
    Status,
    ClosingTime,
    Phone,
    Address,
    MapUrl,
}

impl TargetField {
    /// Column backing this field.
    pub fn column(self) -> &'static str {
        match self {
            TargetField::Image => "image",
            TargetField::Name => "name",
            TargetField::Rating => "rating",
            TargetField::Category => "category",
            TargetField::Status => "status",
            TargetField::ClosingTime => "closing_time",
            TargetField::Phone => "phone",
            TargetField::Address => "address",
            TargetField::MapUrl => "map_url",
        }
    }

    /// Returns true if the stored value counts as missing.
    pub fn is_missing(value: Option<&str>) -> bool {
        match value {
            None => true,
            Some(v) => v.is_empty() || v == NOT_AVAILABLE,
        }
    }
}

impl fmt::Display for TargetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl std::str::FromStr for TargetField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "image" => Ok(TargetField::Image),
            "name" => Ok(TargetField::Name),
            "rating" => Ok(TargetField::Rating),
            "category" => Ok(TargetField::Category),
            "status" => Ok(TargetField::Status),
            "closing_time" => Ok(TargetField::ClosingTime),
            "phone" => Ok(TargetField::Phone),
            "address" => Ok(TargetField::Address),
            "map_url" => Ok(TargetField::MapUrl),
            _ => Err(format!("Unknown field: {}", s)),
        }
    }
}

/// Upsert payload produced by the discovery crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorePayload {
    pub province: Option<String>,
    pub district: Option<String>,
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub rating: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
    pub closing_time: Option<String>,
    pub phone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub map_url: Option<String>,
    /// Creation time for new rows; existing rows keep theirs.
    pub created_at: Option<DateTime<Utc>>,
}

impl StorePayload {
    /// Creates a payload carrying only an identifier and a name.
    pub fn new(place_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { place_id: Some(place_id.into()), name: Some(name.into()), ..Default::default() }
    }

    /// Sets both coordinates.
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Sets the administrative region.
    pub fn with_region(mut self, province: impl Into<String>, district: impl Into<String>) -> Self {
        self.province = Some(province.into());
        self.district = Some(district.into());
        self
    }

    /// Identifier usable for dedup, after sentinel normalisation.
    pub fn usable_place_id(&self) -> Option<&str> {
        self.place_id.as_deref().and_then(PlaceId::normalize)
    }

    /// Geometry derived from this payload's coordinates.
    pub fn geometry(&self) -> Option<GeoPoint> {
        GeoPoint::derive(self.latitude, self.longitude)
    }
}

/// A persisted store record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: i64,
    pub province: Option<String>,
    pub district: Option<String>,
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub rating: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
    pub closing_time: Option<String>,
    pub phone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub map_url: Option<String>,
    pub geometry: Option<GeoPoint>,
    pub created_at: Option<NaiveDateTime>,
}

impl StoreRecord {
    /// Builds a record from a payload, deriving the geometry.
    pub fn from_payload(id: i64, payload: &StorePayload) -> Self {
        Self {
            id,
            province: payload.province.clone(),
            district: payload.district.clone(),
            place_id: payload.usable_place_id().map(String::from),
            name: payload.name.clone(),
            image: payload.image.clone(),
            rating: payload.rating.clone(),
            category: payload.category.clone(),
            status: payload.status.clone(),
            closing_time: payload.closing_time.clone(),
            phone: payload.phone.clone(),
            latitude: payload.latitude,
            longitude: payload.longitude,
            address: payload.address.clone(),
            map_url: payload.map_url.clone(),
            geometry: payload.geometry(),
            created_at: Some(payload.created_at.unwrap_or_else(Utc::now).naive_utc()),
        }
    }

    /// Overwrites every mutable field from the payload; returns true if anything changed.
    pub fn apply(&mut self, payload: &StorePayload) -> bool {
        let updated = Self { id: self.id, created_at: self.created_at, ..Self::from_payload(self.id, payload) };
        if *self == updated {
            return false;
        }
        *self = updated;
        true
    }

    /// Current value of a target field.
    pub fn field(&self, field: TargetField) -> Option<&str> {
        match field {
            TargetField::Image => self.image.as_deref(),
            TargetField::Name => self.name.as_deref(),
            TargetField::Rating => self.rating.as_deref(),
            TargetField::Category => self.category.as_deref(),
            TargetField::Status => self.status.as_deref(),
            TargetField::ClosingTime => self.closing_time.as_deref(),
            TargetField::Phone => self.phone.as_deref(),
            TargetField::Address => self.address.as_deref(),
            TargetField::MapUrl => self.map_url.as_deref(),
        }
    }

    /// Sets a target field.
    pub fn set_field(&mut self, field: TargetField, value: &str) {
        let slot = match field {
            TargetField::Image => &mut self.image,
            TargetField::Name => &mut self.name,
            TargetField::Rating => &mut self.rating,
            TargetField::Category => &mut self.category,
            TargetField::Status => &mut self.status,
            TargetField::ClosingTime => &mut self.closing_time,
            TargetField::Phone => &mut self.phone,
            TargetField::Address => &mut self.address,
            TargetField::MapUrl => &mut self.map_url,
        };
        *slot = Some(value.to_string());
    }

    /// Returns true if the record is a candidate for backfilling `field`.
    pub fn is_pending(&self, field: TargetField) -> bool {
        TargetField::is_missing(self.field(field))
            && self.place_id.as_deref().is_some_and(PlaceId::is_usable)
    }
}

/// One unit of backfill work: a record identity and its place id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingItem {
    pub id: i64,
    pub place_id: String,
}

/// Status of a discovery progress record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Pending,
    Running,
    Partial,
    Done,
    Failed,
}

impl ProgressStatus {
    /// All statuses in lifecycle order.
    pub fn all() -> &'static [ProgressStatus] {
        &[
            ProgressStatus::Pending,
            ProgressStatus::Running,
            ProgressStatus::Partial,
            ProgressStatus::Done,
            ProgressStatus::Failed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Running => "running",
            ProgressStatus::Partial => "partial",
            ProgressStatus::Done => "done",
            ProgressStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProgressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProgressStatus::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                format!("Unknown status: {}. Use: pending, running, partial, done, failed", s)
            })
    }
}

/// Discovery progress for one (province, district, keyword) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub province: String,
    pub district: String,
    pub keyword: String,
    pub status: ProgressStatus,
    pub last_place_id: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// Per-province coverage numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProvinceStats {
    pub province: String,
    pub total: i64,
    pub with_image: i64,
    pub missing_image: i64,
    pub with_geometry: i64,
}
