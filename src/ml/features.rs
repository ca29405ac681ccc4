//! Hourly feature construction
//!
//! Turns irregular, multi-sensor readings of one sector into a gap-free
//! hourly series with one column per sensor type and an irrigation indicator.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Deserialize;

use crate::db::{IrrigationEvent, SensorReading};
use crate::traits::ReadingStore;

/// How missing hourly values are filled after resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Carry the last value forward, then the first value backward
    #[default]
    ForwardBackward,
    /// Carry values forward only; leading hours stay empty
    ForwardOnly,
}

/// One calendar hour of a sector.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyRow {
    /// Start of the hour
    pub hour: NaiveDateTime,
    /// Mean value per sensor column, aligned with `HourlySeries::sensor_columns`
    pub values: Vec<Option<f64>>,
    /// 1 if any irrigation happened during this hour
    pub irrigated: u8,
}

/// Hourly series for one sector, ordered by hour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HourlySeries {
    /// Display names ("Humidity", "Ph", ...) in column order
    pub sensor_columns: Vec<String>,
    pub rows: Vec<HourlyRow>,
}

impl HourlySeries {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Values of a single sensor column, by display name.
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.sensor_columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row.values[idx]).collect())
    }

    /// Irrigation indicator per hour.
    pub fn indicator(&self) -> Vec<u8> {
        self.rows.iter().map(|row| row.irrigated).collect()
    }
}

/// Builds hourly series from the reading store.
#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    fill_policy: FillPolicy,
}

impl FeatureBuilder {
    pub fn new(fill_policy: FillPolicy) -> Self {
        Self { fill_policy }
    }

    pub fn fill_policy(&self) -> FillPolicy {
        self.fill_policy
    }

    /// Fetch a sector's readings and irrigations and build its hourly series.
    ///
    /// Returns an empty series when the sector has no usable readings. Store
    /// failures are propagated.
    pub async fn build_hourly_series<S: ReadingStore>(
        &self,
        store: &S,
        sector_id: &str,
    ) -> Result<HourlySeries> {
        let readings = store.readings_for_sector(sector_id).await?;
        tracing::debug!(sector_id, count = readings.len(), "Fetched readings");
        if readings.is_empty() {
            return Ok(HourlySeries::default());
        }

        let events = store.irrigation_events_for_sector(sector_id).await?;
        tracing::debug!(sector_id, count = events.len(), "Fetched irrigation events");

        let series = self.build_from(&readings, &events);
        tracing::info!(
            sector_id,
            rows = series.len(),
            columns = ?series.sensor_columns,
            "Built hourly series"
        );
        Ok(series)
    }

    /// Pure part of the builder, on already fetched data.
    pub fn build_from(&self, readings: &[SensorReading], events: &[IrrigationEvent]) -> HourlySeries {
        let Some((type_keys, pivot)) = pivot_by_timestamp(readings) else {
            return HourlySeries::default();
        };

        let sensor_columns = type_keys.iter().map(|key| display_name(key)).collect();
        let mut rows = resample_hourly(&pivot, type_keys.len());
        fill_gaps(&mut rows, self.fill_policy);

        let counts = count_events_per_hour(events);
        for row in &mut rows {
            let count = counts.get(&row.hour).copied().unwrap_or(0);
            row.irrigated = u8::from(count > 0);
        }

        HourlySeries {
            sensor_columns,
            rows,
        }
    }
}

/// Canonical display form of a sensor type: "  HUMIDITY " -> "Humidity".
pub fn display_name(sensor_type: &str) -> String {
    let lower = sensor_type.trim().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Start of the hour containing `ts`.
pub fn truncate_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

type PivotTable = BTreeMap<NaiveDateTime, Vec<Option<f64>>>;

/// One row per exact timestamp, one column per sensor type (sorted).
/// Several readings of the same type at the same instant are averaged.
fn pivot_by_timestamp(readings: &[SensorReading]) -> Option<(Vec<String>, PivotTable)> {
    let type_keys: Vec<String> = readings
        .iter()
        .map(|r| r.sensor_type.trim().to_lowercase())
        .filter(|key| !key.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if type_keys.is_empty() {
        return None;
    }

    let mut sums: BTreeMap<NaiveDateTime, Vec<(f64, u32)>> = BTreeMap::new();
    for reading in readings {
        let key = reading.sensor_type.trim().to_lowercase();
        let Ok(col) = type_keys.binary_search(&key) else {
            continue;
        };
        let cells = sums
            .entry(reading.timestamp)
            .or_insert_with(|| vec![(0.0, 0); type_keys.len()]);
        cells[col].0 += reading.value;
        cells[col].1 += 1;
    }

    let pivot = sums
        .into_iter()
        .map(|(ts, cells)| (ts, cells.into_iter().map(mean_cell).collect()))
        .collect();

    Some((type_keys, pivot))
}

fn mean_cell((sum, count): (f64, u32)) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

/// Average the pivot into one row per hour between the first and last
/// timestamp. Hours without data get `None` values.
fn resample_hourly(pivot: &PivotTable, n_columns: usize) -> Vec<HourlyRow> {
    let (Some(first), Some(last)) = (pivot.keys().next(), pivot.keys().next_back()) else {
        return Vec::new();
    };

    let mut buckets: BTreeMap<NaiveDateTime, Vec<(f64, u32)>> = BTreeMap::new();
    for (ts, cells) in pivot {
        let bucket = buckets
            .entry(truncate_to_hour(*ts))
            .or_insert_with(|| vec![(0.0, 0); n_columns]);
        for (acc, cell) in bucket.iter_mut().zip(cells) {
            if let Some(value) = cell {
                acc.0 += value;
                acc.1 += 1;
            }
        }
    }

    let end = truncate_to_hour(*last);
    let mut hour = truncate_to_hour(*first);
    let mut rows = Vec::new();
    while hour <= end {
        let values = match buckets.remove(&hour) {
            Some(cells) => cells.into_iter().map(mean_cell).collect(),
            None => vec![None; n_columns],
        };
        rows.push(HourlyRow {
            hour,
            values,
            irrigated: 0,
        });
        hour += Duration::hours(1);
    }
    rows
}

/// Fill missing values column by column.
fn fill_gaps(rows: &mut [HourlyRow], policy: FillPolicy) {
    let n_columns = rows.first().map_or(0, |row| row.values.len());

    for col in 0..n_columns {
        let mut last = None;
        for row in rows.iter_mut() {
            match row.values[col] {
                Some(value) => last = Some(value),
                None => row.values[col] = last,
            }
        }

        if policy == FillPolicy::ForwardBackward {
            let mut next = None;
            for row in rows.iter_mut().rev() {
                match row.values[col] {
                    Some(value) => next = Some(value),
                    None => row.values[col] = next,
                }
            }
        }
    }
}

/// Number of irrigation events starting in each hour.
fn count_events_per_hour(events: &[IrrigationEvent]) -> BTreeMap<NaiveDateTime, u32> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(truncate_to_hour(event.timestamp)).or_insert(0) += 1;
    }
    counts
}
