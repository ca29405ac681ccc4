use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

use crate::traits::{ReadingSink, ReadingStore};

/// A single sensor reading joined with its sensor's type.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq)]
pub struct SensorReading {
    pub timestamp: NaiveDateTime,
    /// Lower-cased sensor type, e.g. "humidity"
    pub sensor_type: String,
    pub value: f64,
}

/// An irrigation applied to a sector.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq)]
pub struct IrrigationEvent {
    pub timestamp: NaiveDateTime,
    pub volume: f64,
}

// ==================== Record Patches ====================

/// Tables that accept partial updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Sectors,
    Sensors,
    Readings,
    Irrigations,
}

/// Storage class a patched field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Real,
    Timestamp,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Sectors => "sectors",
            Table::Sensors => "sensors",
            Table::Readings => "readings",
            Table::Irrigations => "irrigations",
        }
    }

    fn key_column(&self) -> &'static str {
        match self {
            Table::Sectors => "sector_id",
            Table::Sensors => "sensor_id",
            Table::Readings => "reading_id",
            Table::Irrigations => "irrigation_id",
        }
    }

    /// Sectors and sensors are keyed by name, readings and irrigations by row id.
    pub fn check_key(&self, key: &RecordKey<'_>) -> Result<(), PatchError> {
        let (expected, matches) = match self {
            Table::Sectors | Table::Sensors => ("name", matches!(key, RecordKey::Name(_))),
            Table::Readings | Table::Irrigations => ("id", matches!(key, RecordKey::Id(_))),
        };
        if matches {
            Ok(())
        } else {
            Err(PatchError::KeyMismatch {
                table: self.name(),
                expected,
            })
        }
    }

    /// Fields a patch may touch. Primary keys are never updatable.
    pub fn updatable_fields(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            Table::Sectors => &[
                ("area_hectares", FieldKind::Real),
                ("crop_id", FieldKind::Text),
            ],
            Table::Sensors => &[
                ("sensor_type", FieldKind::Text),
                ("sector_id", FieldKind::Text),
            ],
            Table::Readings => &[
                ("sensor_id", FieldKind::Text),
                ("value", FieldKind::Real),
                ("measured_at", FieldKind::Timestamp),
            ],
            Table::Irrigations => &[
                ("sector_id", FieldKind::Text),
                ("volume", FieldKind::Real),
                ("irrigated_at", FieldKind::Timestamp),
            ],
        }
    }
}

/// New value for a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Real(f64),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Real(_) => FieldKind::Real,
            FieldValue::Timestamp(_) => FieldKind::Timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("patch contains no fields")]
    Empty,
    #[error("table '{table}' has no updatable field '{field}'")]
    UnknownField { table: &'static str, field: String },
    #[error("field '{field}' expects {expected:?}, got {found:?}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("table '{table}' is keyed by {expected}")]
    KeyMismatch {
        table: &'static str,
        expected: &'static str,
    },
}

/// Ordered set of field updates for one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    fields: Vec<(String, FieldValue)>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any earlier value for the same name.
    pub fn set(mut self, field: &str, value: FieldValue) -> Self {
        match self.fields.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = value,
            None => self.fields.push((field.to_string(), value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Check every field against the table's known field set.
    pub fn validate(&self, table: Table) -> Result<(), PatchError> {
        if self.fields.is_empty() {
            return Err(PatchError::Empty);
        }
        for (field, value) in &self.fields {
            let (_, expected) = table
                .updatable_fields()
                .iter()
                .find(|(name, _)| name == field)
                .ok_or_else(|| PatchError::UnknownField {
                    table: table.name(),
                    field: field.clone(),
                })?;
            if value.kind() != *expected {
                return Err(PatchError::TypeMismatch {
                    field: field.clone(),
                    expected: *expected,
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }
}

/// Identifies the record a patch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey<'a> {
    Name(&'a str),
    Id(i64),
}

// ==================== Database ====================

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the SQLite database and run migrations.
    ///
    /// The pool holds a single connection that is never recycled, so
    /// `sqlite::memory:` databases survive for the lifetime of the handle.
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_parent_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL '{}'", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub async fn insert_sector(
        &self,
        sector_id: &str,
        area_hectares: Option<f64>,
        crop_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sectors (sector_id, area_hectares, crop_id) VALUES (?1, ?2, ?3)
             ON CONFLICT (sector_id) DO NOTHING",
        )
        .bind(sector_id)
        .bind(area_hectares)
        .bind(crop_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert sector '{}'", sector_id))?;
        Ok(())
    }

    /// Register a sensor; the type is normalized to lower case.
    pub async fn insert_sensor(
        &self,
        sensor_id: &str,
        sensor_type: &str,
        sector_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensors (sensor_id, sensor_type, sector_id) VALUES (?1, ?2, ?3)
             ON CONFLICT (sensor_id) DO NOTHING",
        )
        .bind(sensor_id)
        .bind(sensor_type.trim().to_lowercase())
        .bind(sector_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert sensor '{}'", sensor_id))?;
        Ok(())
    }

    pub async fn insert_reading(
        &self,
        sensor_id: &str,
        value: f64,
        measured_at: NaiveDateTime,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO readings (sensor_id, value, measured_at) VALUES (?1, ?2, ?3)",
        )
        .bind(sensor_id)
        .bind(value)
        .bind(measured_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert reading")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_irrigation(
        &self,
        sector_id: &str,
        volume: f64,
        irrigated_at: NaiveDateTime,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO irrigations (sector_id, volume, irrigated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(sector_id)
        .bind(volume)
        .bind(irrigated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert irrigation")?;

        Ok(result.last_insert_rowid())
    }

    /// Apply a validated partial update. Returns the number of rows changed.
    pub async fn apply_patch(
        &self,
        table: Table,
        key: RecordKey<'_>,
        patch: &RecordPatch,
    ) -> Result<u64> {
        table.check_key(&key)?;
        patch.validate(table)?;

        // Column names come from the table's static field list, never from input.
        let assignments: Vec<String> = patch
            .fields()
            .iter()
            .map(|(field, _)| format!("{} = ?", field))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            table.name(),
            assignments.join(", "),
            table.key_column()
        );

        let mut query = sqlx::query(&sql);
        for (field, value) in patch.fields() {
            query = match value {
                FieldValue::Text(text) if table == Table::Sensors && field == "sensor_type" => {
                    query.bind(text.trim().to_lowercase())
                }
                FieldValue::Text(text) => query.bind(text.clone()),
                FieldValue::Real(real) => query.bind(*real),
                FieldValue::Timestamp(ts) => query.bind(*ts),
            };
        }
        query = match key {
            RecordKey::Name(name) => query.bind(name.to_string()),
            RecordKey::Id(id) => query.bind(id),
        };

        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update {}", table.name()))?;

        Ok(result.rows_affected())
    }
}

impl ReadingStore for Database {
    async fn readings_for_sector(&self, sector_id: &str) -> Result<Vec<SensorReading>> {
        let readings = sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT
                m.measured_at AS "timestamp",
                LOWER(TRIM(s.sensor_type)) AS sensor_type,
                CAST(m.value AS REAL) AS value
            FROM readings m
            JOIN sensors s ON m.sensor_id = s.sensor_id
            WHERE s.sector_id = ?1
            ORDER BY m.measured_at ASC
            "#,
        )
        .bind(sector_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch readings for sector '{}'", sector_id))?;

        Ok(readings)
    }

    async fn irrigation_events_for_sector(&self, sector_id: &str) -> Result<Vec<IrrigationEvent>> {
        let events = sqlx::query_as::<_, IrrigationEvent>(
            r#"
            SELECT
                irrigated_at AS "timestamp",
                CAST(volume AS REAL) AS volume
            FROM irrigations
            WHERE sector_id = ?1
            ORDER BY irrigated_at ASC
            "#,
        )
        .bind(sector_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch irrigations for sector '{}'", sector_id))?;

        Ok(events)
    }
}

impl ReadingSink for Database {
    async fn record_reading(
        &self,
        sensor_id: &str,
        value: f64,
        measured_at: NaiveDateTime,
    ) -> Result<()> {
        self.insert_reading(sensor_id, value, measured_at).await?;
        Ok(())
    }

    async fn record_irrigation(
        &self,
        sector_id: &str,
        volume: f64,
        irrigated_at: NaiveDateTime,
    ) -> Result<()> {
        self.insert_irrigation(sector_id, volume, irrigated_at).await?;
        Ok(())
    }
}

/// Create the directory holding a file-backed SQLite database.
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
