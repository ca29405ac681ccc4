//! Time features and next-hour target
//!
//! The target of the row for hour T is the irrigation indicator of hour T+1.

use chrono::{Datelike, NaiveDateTime, Timelike};
use ndarray::Array2;

use super::features::HourlySeries;

/// Name of the hour-of-day feature (0-23)
pub const HOUR_OF_DAY: &str = "hour_of_day";
/// Name of the day-of-week feature (0=Monday, 6=Sunday)
pub const DAY_OF_WEEK: &str = "day_of_week";

/// Feature matrix and targets ready for the classifier.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    /// Column names of `records`, in order
    pub feature_names: Vec<String>,
    /// One row per usable hour
    pub records: Array2<f64>,
    /// 1 if irrigation happened in the following hour
    pub targets: Vec<usize>,
    /// Hour each row describes
    pub hours: Vec<NaiveDateTime>,
}

impl TrainingSet {
    pub fn n_samples(&self) -> usize {
        self.targets.len()
    }

    /// Count of (class 0, class 1) rows.
    pub fn class_counts(&self) -> [usize; 2] {
        let positives = self.targets.iter().filter(|&&t| t == 1).count();
        [self.targets.len() - positives, positives]
    }

    pub fn has_both_classes(&self) -> bool {
        let [negatives, positives] = self.class_counts();
        negatives > 0 && positives > 0
    }
}

/// `(hour_of_day, day_of_week)` of a timestamp.
pub fn time_features(at: NaiveDateTime) -> (f64, f64) {
    (
        at.hour() as f64,
        at.weekday().num_days_from_monday() as f64,
    )
}

/// Feature order for a set of sensor columns: sensors first, then time.
pub fn feature_names_for(sensor_columns: &[String]) -> Vec<String> {
    sensor_columns
        .iter()
        .cloned()
        .chain([HOUR_OF_DAY.to_string(), DAY_OF_WEEK.to_string()])
        .collect()
}

/// Add time features, shift the indicator into a next-hour target and drop
/// rows that cannot be used.
///
/// Returns `None` when fewer than two hourly rows exist or nothing survives
/// the shift.
pub fn attach_time_features_and_target(series: &HourlySeries) -> Option<TrainingSet> {
    if series.rows.len() < 2 {
        return None;
    }

    let feature_names = feature_names_for(&series.sensor_columns);
    let n_features = feature_names.len();

    let mut flat = Vec::with_capacity(series.rows.len() * n_features);
    let mut targets = Vec::with_capacity(series.rows.len());
    let mut hours = Vec::with_capacity(series.rows.len());

    // The last row has no successor and never yields a target
    for pair in series.rows.windows(2) {
        let (row, next) = (&pair[0], &pair[1]);
        let Some(values) = row.values.iter().copied().collect::<Option<Vec<f64>>>() else {
            continue;
        };

        let (hour_of_day, day_of_week) = time_features(row.hour);
        flat.extend(values);
        flat.push(hour_of_day);
        flat.push(day_of_week);
        targets.push(usize::from(next.irrigated));
        hours.push(row.hour);
    }

    if targets.is_empty() {
        return None;
    }

    let records = Array2::from_shape_vec((targets.len(), n_features), flat).ok()?;

    tracing::debug!(
        rows = targets.len(),
        features = ?feature_names,
        "Attached time features and next-hour target"
    );

    Some(TrainingSet {
        feature_names,
        records,
        targets,
        hours,
    })
}
