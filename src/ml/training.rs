//! Training pipeline for the irrigation classifier

use ndarray::Axis;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::config::TrainingConfig;
use crate::traits::{Clock, ReadingStore};

use super::evaluation::ClassificationReport;
use super::features::{FeatureBuilder, HourlySeries};
use super::forest::{ForestBuilder, N_CLASSES, RandomForest};
use super::persistence::{ModelArtifact, ModelStore};
use super::target::attach_time_features_and_target;
use super::{ModelContext, PipelineError};

/// What a training run reports back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub sector_id: String,
    pub feature_names: Vec<String>,
    /// Rows per class (no irrigation, irrigation) before the split
    pub class_counts: [usize; N_CLASSES],
    pub train_samples: usize,
    pub test_samples: usize,
    /// Held-out metrics; `None` when the split left no test rows
    pub report: Option<ClassificationReport>,
    /// Mean decrease in impurity, aligned with `feature_names`
    pub feature_importances: Vec<f64>,
}

/// Result of fitting on an already built series
#[derive(Debug)]
pub struct TrainingResult {
    pub classifier: RandomForest,
    pub outcome: TrainingOutcome,
}

/// Split row indices into (train, test), stratified by class.
///
/// Each class is shuffled with the seed and contributes `round(n * fraction)`
/// rows to the test set. A class with at least two rows keeps at least one row
/// on each side; a single-row class stays in training.
pub fn stratified_split(targets: &[usize], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let fraction = test_fraction.clamp(0.0, 1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(targets.len());
    let mut test = Vec::new();

    for class in 0..N_CLASSES {
        let mut members: Vec<usize> = (0..targets.len()).filter(|&i| targets[i] == class).collect();
        members.shuffle(&mut rng);

        let n = members.len();
        let n_test = if n < 2 {
            0
        } else {
            ((n as f64 * fraction).round() as usize).clamp(1, n - 1)
        };

        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Fit and evaluate a forest on a built hourly series.
pub fn train_on_series(
    series: &HourlySeries,
    sector_id: &str,
    config: &TrainingConfig,
) -> Result<TrainingResult, PipelineError> {
    if series.is_empty() {
        return Err(PipelineError::InsufficientData {
            sector_id: sector_id.to_string(),
            reason: "no sensor readings".to_string(),
        });
    }

    let set = attach_time_features_and_target(series).ok_or_else(|| {
        PipelineError::InsufficientData {
            sector_id: sector_id.to_string(),
            reason: format!("{} hourly row(s), at least 2 are required", series.len()),
        }
    })?;

    let class_counts = set.class_counts();
    if !set.has_both_classes() {
        let class = usize::from(class_counts[1] > 0);
        return Err(PipelineError::InsufficientClassDiversity {
            sector_id: sector_id.to_string(),
            class,
        });
    }

    let (train_idx, test_idx) = stratified_split(&set.targets, config.test_fraction, config.seed);
    let train_records = set.records.select(Axis(0), &train_idx);
    let train_targets: Vec<usize> = train_idx.iter().map(|&i| set.targets[i]).collect();

    tracing::info!(
        sector = sector_id,
        rows = set.n_samples(),
        negatives = class_counts[0],
        positives = class_counts[1],
        train = train_idx.len(),
        test = test_idx.len(),
        "Training irrigation classifier"
    );

    let classifier = ForestBuilder::new()
        .n_trees(config.n_trees)
        .max_depth(config.max_depth)
        .min_samples_split(config.min_samples_split)
        .class_balanced(config.class_balanced)
        .seed(config.seed)
        .fit(train_records.view(), &train_targets)?;

    let report = if test_idx.is_empty() {
        tracing::warn!(sector = sector_id, "No held-out rows, skipping evaluation");
        None
    } else {
        let test_records = set.records.select(Axis(0), &test_idx);
        let test_targets: Vec<usize> = test_idx.iter().map(|&i| set.targets[i]).collect();
        let predicted = classifier.predict(test_records.view())?;
        let report = ClassificationReport::new(&test_targets, &predicted)?;
        tracing::info!(
            sector = sector_id,
            accuracy = report.accuracy,
            irrigate_f1 = report.classes[1].f1,
            "Evaluated on held-out rows"
        );
        Some(report)
    };

    let outcome = TrainingOutcome {
        sector_id: sector_id.to_string(),
        feature_names: set.feature_names.clone(),
        class_counts,
        train_samples: train_idx.len(),
        test_samples: test_idx.len(),
        report,
        feature_importances: classifier.feature_importances().to_vec(),
    };

    Ok(TrainingResult { classifier, outcome })
}

/// Train a model using the complete pipeline
///
/// Builds the hourly series from the store, fits, persists the artifact and
/// installs it in `ctx`. Nothing is saved or installed on failure.
pub async fn train<S: ReadingStore, C: Clock>(
    store: &S,
    clock: &C,
    model_store: &ModelStore,
    ctx: &mut ModelContext,
    sector_id: &str,
    features: &FeatureBuilder,
    config: &TrainingConfig,
) -> Result<TrainingOutcome, PipelineError> {
    let series = features
        .build_hourly_series(store, sector_id)
        .await
        .map_err(PipelineError::Store)?;

    let TrainingResult { classifier, outcome } = train_on_series(&series, sector_id, config)?;

    let artifact = ModelArtifact::new(
        sector_id,
        outcome.train_samples,
        classifier,
        outcome.feature_names.clone(),
        clock.now_utc(),
    );
    model_store.save(&artifact)?;
    ctx.install(artifact);

    Ok(outcome)
}
