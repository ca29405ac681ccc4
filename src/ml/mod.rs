//! Machine Learning module for irrigation prediction
//!
//! Readings are turned into an hourly feature matrix, labelled with
//! "irrigation in the next hour" and fed to a class-balanced random forest
//! of linfa decision trees.
//! The fitted forest and its feature order travel together as one artifact.

pub mod evaluation;
pub mod features;
pub mod forest;
pub mod persistence;
pub mod predictor;
pub mod target;
pub mod training;

use thiserror::Error;

pub use evaluation::{ClassMetrics, ClassificationReport};
pub use features::{FeatureBuilder, FillPolicy, HourlyRow, HourlySeries};
pub use forest::{ForestBuilder, ForestError, RandomForest};
pub use persistence::{ModelArtifact, ModelStore, PersistenceError};
pub use predictor::{IrrigationAction, Prediction, predict};
pub use target::{DAY_OF_WEEK, HOUR_OF_DAY, TrainingSet, attach_time_features_and_target};
pub use training::{TrainingOutcome, TrainingResult, train, train_on_series};

/// Errors surfaced by the train and predict operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("insufficient data for sector {sector_id}: {reason}")]
    InsufficientData { sector_id: String, reason: String },

    #[error("insufficient class diversity for sector {sector_id}: every target is {class}")]
    InsufficientClassDiversity { sector_id: String, class: usize },

    #[error("feature mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    FeatureMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("model not trained")]
    ModelNotTrained,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("classifier error: {0}")]
    Classifier(#[from] ForestError),

    #[error("evaluation failed: {0}")]
    Evaluation(#[from] linfa::Error),

    #[error("store access failed: {0:#}")]
    Store(anyhow::Error),
}

impl PipelineError {
    /// Data problems the caller fixes by collecting more readings.
    pub fn is_data_insufficiency(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::InsufficientClassDiversity { .. }
        )
    }
}

/// The currently loaded model, passed explicitly to `train` and `predict`.
#[derive(Debug, Default)]
pub struct ModelContext {
    artifact: Option<ModelArtifact>,
}

impl ModelContext {
    /// A context with no model loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the context with whatever the store holds.
    ///
    /// On error the context is left empty. Returns whether a model is loaded.
    pub fn reload(&mut self, store: &ModelStore) -> Result<bool, PersistenceError> {
        self.artifact = None;
        match store.load() {
            Ok(artifact) => {
                self.artifact = artifact;
                Ok(self.artifact.is_some())
            }
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    error = %e,
                    "Discarding unreadable model artifact"
                );
                Err(e)
            }
        }
    }

    pub fn install(&mut self, artifact: ModelArtifact) {
        self.artifact = Some(artifact);
    }

    pub fn is_trained(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn artifact(&self) -> Option<&ModelArtifact> {
        self.artifact.as_ref()
    }

    /// Feature order of the loaded model
    pub fn feature_names(&self) -> Option<&[String]> {
        self.artifact.as_ref().map(|a| a.feature_names.as_slice())
    }

    /// Sensor features the caller must supply (feature order minus time features).
    pub fn sensor_feature_names(&self) -> Vec<String> {
        self.feature_names()
            .unwrap_or_default()
            .iter()
            .filter(|name| name.as_str() != HOUR_OF_DAY && name.as_str() != DAY_OF_WEEK)
            .cloned()
            .collect()
    }
}
