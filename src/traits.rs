//! Abstractions for time and data access to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for deterministic testing
//! - `ReadingStore`: The per-sector queries the prediction pipeline consumes
//! - `ReadingSink`: Appending readings and irrigation events (simulation)

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use chrono::{DateTime, Local, NaiveDateTime, Utc};

use crate::db::{IrrigationEvent, SensorReading};

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// This allows injecting mock clocks during testing to create
/// deterministic, reproducible tests for time-dependent logic.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current time in the local timezone.
    fn now_local(&self) -> DateTime<Local>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap() = time;
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.utc_time.lock().unwrap();
        *time += duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap()
    }

    fn now_local(&self) -> DateTime<Local> {
        self.now_utc().with_timezone(&Local)
    }
}

// ==================== Store Traits ====================

/// Read side of the reading store, queried once per train/predict call.
pub trait ReadingStore: Send + Sync {
    /// All readings of every sensor installed in the sector, with the
    /// sensor type lower-cased.
    fn readings_for_sector(
        &self,
        sector_id: &str,
    ) -> impl Future<Output = Result<Vec<SensorReading>>> + Send;

    /// All irrigation events recorded for the sector.
    fn irrigation_events_for_sector(
        &self,
        sector_id: &str,
    ) -> impl Future<Output = Result<Vec<IrrigationEvent>>> + Send;
}

/// Write side used by ingestion (manual entry or simulation).
pub trait ReadingSink: Send + Sync {
    fn record_reading(
        &self,
        sensor_id: &str,
        value: f64,
        measured_at: NaiveDateTime,
    ) -> impl Future<Output = Result<()>> + Send;

    fn record_irrigation(
        &self,
        sector_id: &str,
        volume: f64,
        irrigated_at: NaiveDateTime,
    ) -> impl Future<Output = Result<()>> + Send;
}

// ==================== In-Memory Store ====================

#[derive(Debug, Default)]
struct MemoryTables {
    /// sensor_id -> (sensor_type, sector_id)
    sensors: HashMap<String, (String, String)>,
    /// (sensor_id, value, measured_at)
    readings: Vec<(String, f64, NaiveDateTime)>,
    /// (sector_id, volume, irrigated_at)
    irrigations: Vec<(String, f64, NaiveDateTime)>,
}

/// In-memory reading store for tests and offline experiments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor in a sector. The type is stored lower-cased.
    pub fn add_sensor(&self, sensor_id: &str, sensor_type: &str, sector_id: &str) {
        self.tables.lock().unwrap().sensors.insert(
            sensor_id.to_string(),
            (sensor_type.trim().to_lowercase(), sector_id.to_string()),
        );
    }

    /// Append a reading without checking that the sensor exists.
    pub fn add_reading(&self, sensor_id: &str, value: f64, measured_at: NaiveDateTime) {
        self.tables
            .lock()
            .unwrap()
            .readings
            .push((sensor_id.to_string(), value, measured_at));
    }

    pub fn add_irrigation(&self, sector_id: &str, volume: f64, irrigated_at: NaiveDateTime) {
        self.tables
            .lock()
            .unwrap()
            .irrigations
            .push((sector_id.to_string(), volume, irrigated_at));
    }

    /// Number of stored readings across all sectors.
    pub fn reading_count(&self) -> usize {
        self.tables.lock().unwrap().readings.len()
    }

    pub fn irrigation_count(&self) -> usize {
        self.tables.lock().unwrap().irrigations.len()
    }
}

impl ReadingStore for MemoryStore {
    async fn readings_for_sector(&self, sector_id: &str) -> Result<Vec<SensorReading>> {
        let tables = self.tables.lock().unwrap();
        let readings = tables
            .readings
            .iter()
            .filter_map(|(sensor_id, value, measured_at)| {
                let (sensor_type, sensor_sector) = tables.sensors.get(sensor_id)?;
                (sensor_sector == sector_id).then(|| SensorReading {
                    timestamp: *measured_at,
                    sensor_type: sensor_type.clone(),
                    value: *value,
                })
            })
            .collect();
        Ok(readings)
    }

    async fn irrigation_events_for_sector(&self, sector_id: &str) -> Result<Vec<IrrigationEvent>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .irrigations
            .iter()
            .filter(|(sector, _, _)| sector == sector_id)
            .map(|(_, volume, irrigated_at)| IrrigationEvent {
                timestamp: *irrigated_at,
                volume: *volume,
            })
            .collect())
    }
}

impl ReadingSink for MemoryStore {
    async fn record_reading(
        &self,
        sensor_id: &str,
        value: f64,
        measured_at: NaiveDateTime,
    ) -> Result<()> {
        if !self.tables.lock().unwrap().sensors.contains_key(sensor_id) {
            bail!("Unknown sensor '{}'", sensor_id);
        }
        self.add_reading(sensor_id, value, measured_at);
        Ok(())
    }

    async fn record_irrigation(
        &self,
        sector_id: &str,
        volume: f64,
        irrigated_at: NaiveDateTime,
    ) -> Result<()> {
        self.add_irrigation(sector_id, volume, irrigated_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 17)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_system_clock_returns_current_time() {
        let clock = SystemClock;
        let before = Utc::now();
        let clock_time = clock.now_utc();
        let after = Utc::now();

        assert!(clock_time >= before);
        assert!(clock_time <= after);
    }

    #[test]
    fn test_mock_clock_returns_set_time() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 6, 15, 14, 30, 0).unwrap();
        let clock = MockClock::new(fixed_time);

        assert_eq!(clock.now_utc(), fixed_time);
    }

    #[test]
    fn test_mock_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let clock = MockClock::new(start);

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(
            clock.now_utc(),
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
        );

        clock.set_time(start);
        assert_eq!(clock.now_utc(), start);
    }

    #[tokio::test]
    async fn test_memory_store_filters_by_sector() {
        let store = MemoryStore::new();
        store.add_sensor("U1", "Humidity", "S1");
        store.add_sensor("U2", "humidity", "S2");
        store.add_reading("U1", 50.0, at(1));
        store.add_reading("U2", 70.0, at(1));
        store.add_irrigation("S1", 500.0, at(2));
        store.add_irrigation("S2", 480.0, at(3));

        let readings = store.readings_for_sector("S1").await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_type, "humidity");
        assert_eq!(readings[0].value, 50.0);

        let events = store.irrigation_events_for_sector("S2").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, at(3));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_unknown_sensor() {
        let store = MemoryStore::new();
        let result = store.record_reading("missing", 1.0, at(0)).await;

        assert!(result.is_err());
        assert_eq!(store.reading_count(), 0);
    }
}
