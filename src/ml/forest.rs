//! Random Forest Ensemble
//!
//! Bagged `linfa_trees` decision trees for the binary "irrigate next hour"
//! decision. Every tree sees a bootstrap sample of the rows and a random
//! subset of the columns. Class-balanced weights go in as dataset weights, so
//! the Gini splits count a rare irrigation hour as much as the dry majority.

use linfa::prelude::*;
use linfa_trees::{DecisionTree, SplitQuality};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of target classes (0 = no irrigation, 1 = irrigation)
pub const N_CLASSES: usize = 2;

/// Errors raised while fitting or querying a forest
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForestError {
    #[error("no training samples")]
    Empty,
    #[error("feature and target lengths mismatch: {features} vs {targets}")]
    MismatchedLengths { features: usize, targets: usize },
    #[error("target class {0} is not binary")]
    InvalidClass(usize),
    #[error("expected {expected} features, got {found}")]
    FeatureCount { expected: usize, found: usize },
    #[error("tree fit failed: {0}")]
    Fit(String),
    #[error("malformed forest: {0}")]
    Malformed(String),
}

/// Weights `n / (n_classes * count)` so both classes carry equal total weight.
pub fn balanced_class_weights(targets: &[usize]) -> [f64; N_CLASSES] {
    let mut counts = [0usize; N_CLASSES];
    for &t in targets {
        counts[t] += 1;
    }
    let present = counts.iter().filter(|&&c| c > 0).count().max(1);
    counts.map(|c| {
        if c == 0 {
            0.0
        } else {
            targets.len() as f64 / (present * c) as f64
        }
    })
}

/// One member of the ensemble and the columns it was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BaggedTree {
    /// Column indices into the full feature matrix, ascending
    features: Vec<usize>,
    tree: DecisionTree<f64, usize>,
}

impl BaggedTree {
    /// Walk every node and check what prediction relies on.
    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.features.is_empty() {
            return Err("tree has no columns".to_string());
        }
        if let Some(&column) = self.features.iter().find(|&&c| c >= n_features) {
            return Err(format!("column {} out of range for {} features", column, n_features));
        }

        for node in self.tree.iter_nodes() {
            if node.is_leaf() {
                match node.prediction() {
                    Some(class) if class < N_CLASSES => {}
                    other => return Err(format!("leaf predicts {:?}", other)),
                }
                continue;
            }

            let (feature, threshold, _) = node.split();
            if feature >= self.features.len() {
                return Err(format!(
                    "split on column {} of a {}-column tree",
                    feature,
                    self.features.len()
                ));
            }
            if !threshold.is_finite() {
                return Err(format!("split threshold {} is not finite", threshold));
            }
            if node.children().iter().any(|child| child.is_none()) {
                return Err("split node is missing a child".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ForestParams {
    n_trees: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    /// Columns drawn per tree; `None` means `ceil(sqrt(n_features))`
    max_features: Option<usize>,
    class_balanced: bool,
    seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            max_features: None,
            class_balanced: true,
            seed: 42,
        }
    }
}

/// Builder for fitting a forest
#[derive(Debug, Clone, Default)]
pub struct ForestBuilder {
    params: ForestParams,
}

impl ForestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_trees(mut self, n_trees: usize) -> Self {
        self.params.n_trees = n_trees.max(1);
        self
    }

    pub fn max_depth(mut self, depth: Option<usize>) -> Self {
        self.params.max_depth = depth;
        self
    }

    pub fn min_samples_split(mut self, samples: usize) -> Self {
        self.params.min_samples_split = samples.max(2);
        self
    }

    pub fn max_features(mut self, features: Option<usize>) -> Self {
        self.params.max_features = features;
        self
    }

    pub fn class_balanced(mut self, balanced: bool) -> Self {
        self.params.class_balanced = balanced;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = seed;
        self
    }

    /// Fit the forest on `records` (one row per hour) and binary `targets`.
    pub fn fit(
        &self,
        records: ArrayView2<'_, f64>,
        targets: &[usize],
    ) -> Result<RandomForest, ForestError> {
        let n_samples = records.nrows();
        let n_features = records.ncols();
        if n_samples == 0 || targets.is_empty() || n_features == 0 {
            return Err(ForestError::Empty);
        }
        if n_samples != targets.len() {
            return Err(ForestError::MismatchedLengths {
                features: n_samples,
                targets: targets.len(),
            });
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= N_CLASSES) {
            return Err(ForestError::InvalidClass(bad));
        }

        let class_weights = if self.params.class_balanced {
            balanced_class_weights(targets)
        } else {
            [1.0; N_CLASSES]
        };
        // A leaf may hold a single sample of either class
        let min_leaf_weight = class_weights
            .iter()
            .copied()
            .filter(|&w| w > 0.0)
            .fold(f64::INFINITY, f64::min) as f32;
        let subspace = self
            .params
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().ceil() as usize)
            .clamp(1, n_features);

        let tree_params = DecisionTree::<f64, usize>::params()
            .split_quality(SplitQuality::Gini)
            .max_depth(self.params.max_depth)
            .min_weight_split(self.params.min_samples_split as f32)
            .min_weight_leaf(min_leaf_weight);

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut trees = Vec::with_capacity(self.params.n_trees);

        for _ in 0..self.params.n_trees {
            let rows: Vec<usize> = (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect();
            let mut features = rand::seq::index::sample(&mut rng, n_features, subspace).into_vec();
            features.sort_unstable();

            let sample = records.select(Axis(0), &rows).select(Axis(1), &features);
            let labels: Array1<usize> = rows.iter().map(|&i| targets[i]).collect();
            let weights: Array1<f32> = labels.iter().map(|&t| class_weights[t] as f32).collect();
            let dataset = Dataset::new(sample, labels).with_weights(weights);

            let tree = tree_params
                .fit(&dataset)
                .map_err(|e: linfa::Error| ForestError::Fit(e.to_string()))?;
            trees.push(BaggedTree { features, tree });
        }

        let feature_importances = mean_importances(&trees, n_features);
        Ok(RandomForest {
            trees,
            n_features,
            feature_importances,
        })
    }
}

/// Average the per-tree relative impurity decrease over the full column set.
///
/// Trees that never split carry no importance and are skipped.
fn mean_importances(trees: &[BaggedTree], n_features: usize) -> Vec<f64> {
    let mut importances = vec![0.0; n_features];
    for member in trees {
        let local = member.tree.feature_importance();
        let total: f64 = local.iter().filter(|v| v.is_finite()).sum();
        if !total.is_finite() || total <= 0.0 {
            continue;
        }
        for (&column, value) in member.features.iter().zip(&local) {
            if value.is_finite() {
                importances[column] += value / total;
            }
        }
    }

    let sum: f64 = importances.iter().sum();
    if sum > 0.0 {
        for imp in &mut importances {
            *imp /= sum;
        }
    }
    importances
}

/// Fitted ensemble of decision trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<BaggedTree>,
    n_features: usize,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Impurity-decrease importance per feature, summing to 1 when any split exists
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Check the structure prediction relies on.
    ///
    /// A forest fitted here always passes; this guards forests read back from
    /// disk, where indexing into a bad tree would panic.
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.trees.is_empty() {
            return Err(ForestError::Malformed("no trees".to_string()));
        }
        if self.feature_importances.len() != self.n_features {
            return Err(ForestError::Malformed(format!(
                "{} importances for {} features",
                self.feature_importances.len(),
                self.n_features
            )));
        }
        for (i, member) in self.trees.iter().enumerate() {
            member
                .validate(self.n_features)
                .map_err(|reason| ForestError::Malformed(format!("tree {}: {}", i, reason)))?;
        }
        Ok(())
    }

    /// Share of trees voting for irrigation, per row.
    pub fn predict_proba_batch(
        &self,
        records: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, ForestError> {
        if records.ncols() != self.n_features {
            return Err(ForestError::FeatureCount {
                expected: self.n_features,
                found: records.ncols(),
            });
        }
        if self.trees.is_empty() {
            return Err(ForestError::Empty);
        }

        let mut votes = Array1::<f64>::zeros(records.nrows());
        for member in &self.trees {
            let columns = records.select(Axis(1), &member.features);
            let predicted: Array1<usize> = member.tree.predict(&columns);
            votes.zip_mut_with(&predicted, |vote, &class| *vote += class as f64);
        }
        Ok(votes / self.trees.len() as f64)
    }

    /// Probability of class 1 (irrigation) for one row.
    pub fn predict_proba(&self, row: ArrayView1<'_, f64>) -> Result<f64, ForestError> {
        let proba = self.predict_proba_batch(row.insert_axis(Axis(0)))?;
        Ok(proba[0].clamp(0.0, 1.0))
    }

    /// Classes for every row of a matrix; ties go to class 0.
    pub fn predict(&self, records: ArrayView2<'_, f64>) -> Result<Vec<usize>, ForestError> {
        let proba = self.predict_proba_batch(records)?;
        Ok(proba.iter().map(|&p| usize::from(p > 0.5)).collect())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};
    use serde_json::Value;

    use super::*;

    /// Two features; class is 1 when the first feature is below 40.
    fn threshold_data(n: usize) -> (Array2<f64>, Vec<usize>) {
        let mut flat = Vec::with_capacity(n * 2);
        let mut targets = Vec::with_capacity(n);
        for i in 0..n {
            let humidity = 20.0 + (i % 50) as f64;
            flat.push(humidity);
            flat.push((i % 24) as f64);
            targets.push(usize::from(humidity < 40.0));
        }
        (Array2::from_shape_vec((n, 2), flat).unwrap(), targets)
    }

    /// Re-read a forest after editing its serialised form.
    fn tampered(forest: &RandomForest, edit: impl FnOnce(&mut Value)) -> RandomForest {
        let mut value = serde_json::to_value(forest).unwrap();
        edit(&mut value);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_balanced_class_weights() {
        let weights = balanced_class_weights(&[0, 0, 0, 1]);
        // 4 / (2 * 3) and 4 / (2 * 1)
        assert_relative_eq!(weights[0], 4.0 / 6.0);
        assert_relative_eq!(weights[1], 2.0);
    }

    #[test]
    fn test_fit_empty() {
        let records = Array2::<f64>::zeros((0, 2));
        let result = ForestBuilder::new().fit(records.view(), &[]);
        assert_eq!(result.unwrap_err(), ForestError::Empty);
    }

    #[test]
    fn test_fit_mismatched_lengths() {
        let (records, _) = threshold_data(10);
        let result = ForestBuilder::new().fit(records.view(), &[0, 1]);
        assert!(matches!(
            result,
            Err(ForestError::MismatchedLengths {
                features: 10,
                targets: 2
            })
        ));
    }

    #[test]
    fn test_fit_rejects_non_binary_target() {
        let records = array![[1.0], [2.0]];
        let result = ForestBuilder::new().fit(records.view(), &[0, 2]);
        assert_eq!(result.unwrap_err(), ForestError::InvalidClass(2));
    }

    #[test]
    fn test_forest_learns_threshold() {
        let (records, targets) = threshold_data(200);
        let forest = ForestBuilder::new()
            .n_trees(25)
            .fit(records.view(), &targets)
            .unwrap();

        assert_eq!(forest.n_trees(), 25);
        let dry = forest.predict_proba(array![25.0, 10.0].view()).unwrap();
        let wet = forest.predict_proba(array![65.0, 10.0].view()).unwrap();
        assert!(dry > 0.5, "dry probability was {}", dry);
        assert!(wet < 0.5, "wet probability was {}", wet);

        let predictions = forest.predict(records.view()).unwrap();
        let correct = predictions
            .iter()
            .zip(&targets)
            .filter(|(p, t)| p == t)
            .count();
        assert!(correct as f64 / targets.len() as f64 > 0.95);
    }

    #[test]
    fn test_importances_favour_informative_feature() {
        let (records, targets) = threshold_data(200);
        let forest = ForestBuilder::new()
            .n_trees(20)
            .max_features(Some(2))
            .fit(records.view(), &targets)
            .unwrap();

        let importances = forest.feature_importances();
        assert_relative_eq!(importances.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn test_same_seed_same_forest() {
        let (records, targets) = threshold_data(60);
        let a = ForestBuilder::new().n_trees(5).seed(7).fit(records.view(), &targets).unwrap();
        let b = ForestBuilder::new().n_trees(5).seed(7).fit(records.view(), &targets).unwrap();

        let columns = |f: &RandomForest| f.trees.iter().map(|t| t.features.clone()).collect::<Vec<_>>();
        assert_eq!(columns(&a), columns(&b));
        assert_eq!(
            a.predict_proba_batch(records.view()).unwrap(),
            b.predict_proba_batch(records.view()).unwrap()
        );
    }

    #[test]
    fn test_max_depth_limits_tree() {
        let (records, targets) = threshold_data(100);
        let forest = ForestBuilder::new()
            .n_trees(3)
            .max_depth(Some(1))
            .fit(records.view(), &targets)
            .unwrap();

        for member in &forest.trees {
            assert!(member.tree.max_depth() <= 1);
            assert!(member.tree.num_leaves() <= 2);
        }
    }

    #[test]
    fn test_predict_proba_wrong_width() {
        let (records, targets) = threshold_data(40);
        let forest = ForestBuilder::new().n_trees(2).fit(records.view(), &targets).unwrap();

        let result = forest.predict_proba(array![1.0, 2.0, 3.0].view());
        assert_eq!(
            result.unwrap_err(),
            ForestError::FeatureCount {
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn test_single_class_forest_is_certain() {
        let records = array![[1.0], [2.0], [3.0]];
        let forest = ForestBuilder::new()
            .n_trees(3)
            .class_balanced(false)
            .fit(records.view(), &[0, 0, 0])
            .unwrap();

        assert_eq!(forest.predict_proba(array![2.0].view()).unwrap(), 0.0);
    }

    #[test]
    fn test_fitted_forest_validates() {
        let (records, targets) = threshold_data(60);
        let forest = ForestBuilder::new().n_trees(5).fit(records.view(), &targets).unwrap();

        assert_eq!(forest.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_column_out_of_range() {
        let (records, targets) = threshold_data(40);
        let forest = ForestBuilder::new().n_trees(2).fit(records.view(), &targets).unwrap();

        let bad = tampered(&forest, |v| v["trees"][0]["features"] = serde_json::json!([7]));

        assert!(matches!(bad.validate(), Err(ForestError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_split_without_children() {
        let (records, targets) = threshold_data(40);
        let forest = ForestBuilder::new().n_trees(2).fit(records.view(), &targets).unwrap();

        let bad = tampered(&forest, |v| {
            let root = &mut v["trees"][0]["tree"]["root_node"];
            root["leaf_node"] = Value::Bool(false);
            root["left_child"] = Value::Null;
        });

        assert!(matches!(bad.validate(), Err(ForestError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_split_on_unknown_column() {
        let (records, targets) = threshold_data(40);
        let forest = ForestBuilder::new().n_trees(2).fit(records.view(), &targets).unwrap();

        let bad = tampered(&forest, |v| {
            let root = &mut v["trees"][0]["tree"]["root_node"];
            root["leaf_node"] = Value::Bool(false);
            root["feature_idx"] = serde_json::json!(9);
        });

        assert!(matches!(bad.validate(), Err(ForestError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_non_binary_leaf() {
        let records = array![[1.0], [2.0], [3.0]];
        let forest = ForestBuilder::new()
            .n_trees(1)
            .fit(records.view(), &[0, 0, 0])
            .unwrap();

        let bad = tampered(&forest, |v| {
            v["trees"][0]["tree"]["root_node"]["prediction"] = serde_json::json!(5);
        });

        assert!(matches!(bad.validate(), Err(ForestError::Malformed(_))));
    }
}
