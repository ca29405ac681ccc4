//! CSV export of a sector's engineered hourly matrix.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::ml::features::{FeatureBuilder, HourlySeries};
use crate::ml::target::{DAY_OF_WEEK, HOUR_OF_DAY, time_features};
use crate::traits::{Clock, ReadingStore};

/// Write the hourly series as CSV.
///
/// Columns: timestamp, one per sensor, irrigation indicator, time features and
/// the next-hour target (empty on the last row).
pub fn write_series<W: Write>(series: &HourlySeries, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    let mut header = vec!["timestamp".to_string()];
    header.extend(series.sensor_columns.iter().cloned());
    header.extend(
        ["irrigation", HOUR_OF_DAY, DAY_OF_WEEK, "target"]
            .iter()
            .map(|s| s.to_string()),
    );
    wtr.write_record(&header)
        .context("Failed to write CSV header")?;

    for (i, row) in series.rows.iter().enumerate() {
        let (hour_of_day, day_of_week) = time_features(row.hour);
        let target = series
            .rows
            .get(i + 1)
            .map(|next| next.irrigated.to_string())
            .unwrap_or_default();

        let mut record = vec![row.hour.format("%Y-%m-%d %H:%M:%S").to_string()];
        record.extend(
            row.values
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
        );
        record.push(row.irrigated.to_string());
        record.push(hour_of_day.to_string());
        record.push(day_of_week.to_string());
        record.push(target);

        wtr.write_record(&record)
            .context("Failed to write CSV row")?;
    }

    wtr.flush().context("Failed to flush CSV writer")?;
    Ok(())
}

/// The sector id becomes part of the file name, so it may not contain a path.
fn check_file_component(sector_id: &str) -> Result<()> {
    if sector_id.trim().is_empty() {
        bail!("Sector id is empty");
    }
    if sector_id
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || std::path::is_separator(c))
    {
        bail!("Sector id '{}' contains a path separator", sector_id.escape_default());
    }
    Ok(())
}

/// Build the sector's series and write it to a timestamped file in `output_dir`.
pub async fn export_feature_matrix<S: ReadingStore, C: Clock>(
    store: &S,
    clock: &C,
    features: &FeatureBuilder,
    sector_id: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    check_file_component(sector_id)?;

    let series = features
        .build_hourly_series(store, sector_id)
        .await
        .context("Failed to build hourly series for export")?;

    let export_time = clock.now_utc();
    let filename = format!(
        "features_{}_{}.csv",
        sector_id,
        export_time.format("%Y%m%d_%H%M%S")
    );
    let output_path = output_dir.join(&filename);

    let path = output_path.clone();
    let rows = series.len();
    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create export directory")?;
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write_series(&series, file)
    })
    .await
    .context("CSV export task failed")??;

    tracing::info!(sector = sector_id, rows, path = %output_path.display(), "Exported feature matrix");
    Ok(output_path)
}
