//! One-row inference against the loaded model

use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use ndarray::Array1;
use serde::Serialize;

use super::target::{DAY_OF_WEEK, HOUR_OF_DAY, time_features};
use super::{ModelContext, PipelineError};

/// Recommendation for the next hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrigationAction {
    Irrigate,
    Hold,
}

impl IrrigationAction {
    pub fn from_probability(probability: f64) -> Self {
        if probability > 0.5 {
            Self::Irrigate
        } else {
            Self::Hold
        }
    }

    /// User-facing sentence for a sector.
    pub fn label(&self, sector_id: &str) -> String {
        match self {
            Self::Irrigate => format!("Irrigate sector {} in the next hour.", sector_id),
            Self::Hold => format!("Do not irrigate sector {} in the next hour.", sector_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub sector_id: String,
    pub at: NaiveDateTime,
    pub action: IrrigationAction,
    /// Estimated probability of the irrigate class
    pub probability: f64,
}

impl Prediction {
    pub fn label(&self) -> String {
        self.action.label(&self.sector_id)
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (probability of irrigation: {:.2})",
            self.label(),
            self.probability
        )
    }
}

/// Arrange named values into the exact column order of `feature_names`.
///
/// Any missing or unexpected name fails the whole row.
pub fn arrange_features(
    feature_names: &[String],
    values: &HashMap<String, f64>,
) -> Result<Array1<f64>, PipelineError> {
    let missing: Vec<String> = feature_names
        .iter()
        .filter(|name| !values.contains_key(name.as_str()))
        .cloned()
        .collect();

    let mut unexpected: Vec<String> = values
        .keys()
        .filter(|key| !feature_names.contains(key))
        .cloned()
        .collect();
    unexpected.sort();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(PipelineError::FeatureMismatch { missing, unexpected });
    }

    Ok(feature_names.iter().map(|name| values[name.as_str()]).collect())
}

/// Predict whether the sector needs irrigation in the hour after `at`.
///
/// `current_readings` holds sensor features by name; time features are
/// derived from `at` and replace any caller-supplied values.
pub fn predict(
    ctx: &ModelContext,
    sector_id: &str,
    current_readings: &HashMap<String, f64>,
    at: NaiveDateTime,
) -> Result<Prediction, PipelineError> {
    let artifact = ctx.artifact().ok_or(PipelineError::ModelNotTrained)?;

    if artifact.sector_id != sector_id {
        tracing::warn!(
            sector = sector_id,
            trained_for = %artifact.sector_id,
            "Predicting with a model trained for another sector"
        );
    }

    let (hour_of_day, day_of_week) = time_features(at);
    let mut augmented = current_readings.clone();
    augmented.insert(HOUR_OF_DAY.to_string(), hour_of_day);
    augmented.insert(DAY_OF_WEEK.to_string(), day_of_week);

    let row = arrange_features(&artifact.feature_names, &augmented)?;
    let probability = artifact.classifier.predict_proba(row.view())?;
    let action = IrrigationAction::from_probability(probability);

    tracing::debug!(
        sector = sector_id,
        %at,
        probability,
        ?action,
        "Prediction"
    );

    Ok(Prediction {
        sector_id: sector_id.to_string(),
        at,
        action,
        probability,
    })
}
