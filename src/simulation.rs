//! Synthetic history for a sector, used to bootstrap training.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::traits::{Clock, ReadingSink};

/// Sensors receiving simulated readings
#[derive(Debug, Clone)]
pub struct SimulatedSensors {
    pub humidity: String,
    pub ph: String,
    pub phosphorus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SimulationSummary {
    pub hours: usize,
    pub readings: usize,
    pub irrigations: usize,
}

/// Humidity below this between `IRRIGATION_HOURS` triggers an irrigation.
const DRY_HUMIDITY: f64 = 55.0;
const IRRIGATION_HOURS: std::ops::RangeInclusive<u32> = 5..=8;

/// Write `days` whole days of hourly readings, ending at the last local
/// midnight before the clock's time.
///
/// Humidity is uniform in 30-90 minus half the hour of day, so mornings are
/// wetter than afternoons. pH lies in 6.0-7.5 and phosphorus in 15-45. A dry
/// early-morning hour gets an irrigation of 450-550 litres.
pub async fn simulate_history<S: ReadingSink, C: Clock>(
    sink: &S,
    clock: &C,
    sector_id: &str,
    sensors: &SimulatedSensors,
    days: u32,
    seed: u64,
) -> Result<SimulationSummary> {
    let mut rng = StdRng::seed_from_u64(seed);
    let first_day = clock.now_local().date_naive() - Duration::days(i64::from(days));
    let start = first_day.and_time(NaiveTime::MIN);
    let mut summary = SimulationSummary::default();

    for day in 0..days {
        for hour in 0..24u32 {
            let measured_at = start + Duration::days(i64::from(day)) + Duration::hours(i64::from(hour));

            let humidity = rng.gen_range(30.0..90.0) - f64::from(hour) / 2.0;
            let ph = rng.gen_range(6.0..7.5);
            let phosphorus = rng.gen_range(15.0..45.0);

            for (sensor_id, value) in [
                (&sensors.humidity, humidity),
                (&sensors.ph, ph),
                (&sensors.phosphorus, phosphorus),
            ] {
                sink.record_reading(sensor_id, value, measured_at)
                    .await
                    .with_context(|| format!("Failed to record reading for sensor {}", sensor_id))?;
                summary.readings += 1;
            }

            if humidity < DRY_HUMIDITY && IRRIGATION_HOURS.contains(&hour) {
                let volume = rng.gen_range(450.0..550.0);
                sink.record_irrigation(sector_id, volume, measured_at)
                    .await
                    .with_context(|| format!("Failed to record irrigation for sector {}", sector_id))?;
                summary.irrigations += 1;
            }

            summary.hours += 1;
        }
    }

    tracing::info!(
        sector = sector_id,
        days,
        readings = summary.readings,
        irrigations = summary.irrigations,
        "Simulated sensor history"
    );

    Ok(summary)
}
