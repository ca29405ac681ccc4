//! Integration tests for database operations.
//!
//! Each test runs against its own in-memory SQLite database.

use chrono::{NaiveDate, NaiveDateTime};
use irrigation_advisor::db::{Database, FieldValue, PatchError, RecordKey, RecordPatch, Table};
use irrigation_advisor::{ReadingSink, ReadingStore};

async fn memory_db() -> Database {
    Database::new("sqlite::memory:")
        .await
        .expect("in-memory database should open")
}

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Sector S1 with a humidity and a pH sensor, sector S2 with one humidity sensor.
async fn seeded_db() -> Database {
    let db = memory_db().await;
    db.insert_sector("S1", Some(2.5), None).await.unwrap();
    db.insert_sector("S2", None, None).await.unwrap();
    db.insert_sensor("U1", "Humidity", "S1").await.unwrap();
    db.insert_sensor("P1", " PH ", "S1").await.unwrap();
    db.insert_sensor("U2", "humidity", "S2").await.unwrap();
    db
}

#[tokio::test]
async fn test_database_creation() {
    let result = Database::new("sqlite::memory:").await;
    assert!(result.is_ok(), "Database creation should succeed: {:?}", result.err());
}

#[tokio::test]
async fn test_file_database_creates_parent_dir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("agri.db");
    let url = format!("sqlite://{}", path.display());

    Database::new(&url).await.unwrap();

    assert!(path.exists());
}

#[tokio::test]
async fn test_readings_are_scoped_to_sector_and_normalized() {
    let db = seeded_db().await;
    db.insert_reading("U1", 55.0, at(17, 10, 15)).await.unwrap();
    db.insert_reading("P1", 6.4, at(17, 10, 20)).await.unwrap();
    db.insert_reading("U2", 80.0, at(17, 10, 15)).await.unwrap();

    let readings = db.readings_for_sector("S1").await.unwrap();

    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].sensor_type, "humidity");
    assert_eq!(readings[0].timestamp, at(17, 10, 15));
    assert_eq!(readings[1].sensor_type, "ph");
    assert_eq!(readings[1].value, 6.4);
}

#[tokio::test]
async fn test_readings_ordered_by_time() {
    let db = seeded_db().await;
    db.insert_reading("U1", 40.0, at(17, 12, 0)).await.unwrap();
    db.insert_reading("U1", 50.0, at(17, 9, 0)).await.unwrap();
    db.insert_reading("U1", 45.0, at(16, 23, 30)).await.unwrap();

    let readings = db.readings_for_sector("S1").await.unwrap();
    let values: Vec<f64> = readings.iter().map(|r| r.value).collect();

    assert_eq!(values, vec![45.0, 50.0, 40.0]);
}

#[tokio::test]
async fn test_irrigation_events_for_sector() {
    let db = seeded_db().await;
    let id = db.insert_irrigation("S1", 500.0, at(17, 6, 10)).await.unwrap();
    db.insert_irrigation("S2", 470.0, at(17, 7, 0)).await.unwrap();

    assert!(id > 0, "Insert should return a positive ID");

    let events = db.irrigation_events_for_sector("S1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].volume, 500.0);
    assert_eq!(events[0].timestamp, at(17, 6, 10));
}

#[tokio::test]
async fn test_unknown_sector_is_empty() {
    let db = seeded_db().await;

    assert!(db.readings_for_sector("missing").await.unwrap().is_empty());
    assert!(db.irrigation_events_for_sector("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reading_for_unknown_sensor_fails() {
    let db = seeded_db().await;

    let result = db.record_reading("nope", 1.0, at(17, 0, 0)).await;

    assert!(result.is_err(), "Foreign key should reject unknown sensor");
}

#[tokio::test]
async fn test_duplicate_sensor_is_ignored() {
    let db = seeded_db().await;

    db.insert_sensor("U1", "phosphorus", "S2").await.unwrap();
    db.insert_reading("U1", 52.0, at(17, 1, 0)).await.unwrap();

    let readings = db.readings_for_sector("S1").await.unwrap();
    assert_eq!(readings[0].sensor_type, "humidity");
}

#[tokio::test]
async fn test_apply_patch_updates_reading() {
    let db = seeded_db().await;
    let id = db.insert_reading("U1", 30.0, at(17, 3, 0)).await.unwrap();

    let patch = RecordPatch::new()
        .set("value", FieldValue::Real(33.5))
        .set("measured_at", FieldValue::Timestamp(at(17, 4, 0)));
    let changed = db.apply_patch(Table::Readings, RecordKey::Id(id), &patch).await.unwrap();

    assert_eq!(changed, 1);
    let readings = db.readings_for_sector("S1").await.unwrap();
    assert_eq!(readings[0].value, 33.5);
    assert_eq!(readings[0].timestamp, at(17, 4, 0));
}

#[tokio::test]
async fn test_apply_patch_normalizes_sensor_type() {
    let db = seeded_db().await;
    db.insert_reading("P1", 6.9, at(17, 2, 0)).await.unwrap();

    let patch = RecordPatch::new().set("sensor_type", FieldValue::Text("Phosphorus".into()));
    db.apply_patch(Table::Sensors, RecordKey::Name("P1"), &patch)
        .await
        .unwrap();

    let readings = db.readings_for_sector("S1").await.unwrap();
    assert_eq!(readings[0].sensor_type, "phosphorus");
}

#[tokio::test]
async fn test_apply_patch_rejects_key_field() {
    let db = seeded_db().await;

    let patch = RecordPatch::new().set("sector_id", FieldValue::Text("S9".into()));
    let err = db
        .apply_patch(Table::Sectors, RecordKey::Name("S1"), &patch)
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<PatchError>(),
        Some(&PatchError::UnknownField {
            table: "sectors",
            field: "sector_id".to_string()
        })
    );
}

#[tokio::test]
async fn test_apply_patch_rejects_wrong_key_type() {
    let db = seeded_db().await;

    let patch = RecordPatch::new().set("area_hectares", FieldValue::Real(2.5));
    let err = db
        .apply_patch(Table::Sectors, RecordKey::Id(3), &patch)
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<PatchError>(),
        Some(&PatchError::KeyMismatch {
            table: "sectors",
            expected: "name"
        })
    );
}

#[tokio::test]
async fn test_apply_patch_missing_record_changes_nothing() {
    let db = seeded_db().await;

    let patch = RecordPatch::new().set("volume", FieldValue::Real(100.0));
    let changed = db
        .apply_patch(Table::Irrigations, RecordKey::Id(999), &patch)
        .await
        .unwrap();

    assert_eq!(changed, 0);
}
