//! Model persistence - save and load the classifier together with its
//! feature order as one artifact

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::forest::RandomForest;

/// Everything needed to predict: the fitted forest and the column order it
/// was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Version for backward compatibility
    pub version: u32,
    /// When the model was trained
    pub created_at: DateTime<Utc>,
    /// Sector the model was trained for
    pub sector_id: String,
    /// Number of rows the forest was fitted on
    pub training_samples: usize,
    pub classifier: RandomForest,
    /// Feature names in the exact order of the training matrix columns
    pub feature_names: Vec<String>,
}

impl ModelArtifact {
    /// Current version number
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(
        sector_id: impl Into<String>,
        training_samples: usize,
        classifier: RandomForest,
        feature_names: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            created_at,
            sector_id: sector_id.into(),
            training_samples,
            classifier,
            feature_names,
        }
    }

    /// Classifier width and feature list must agree, and every tree must be
    /// safe to walk.
    fn check_consistency(&self) -> Result<(), PersistenceError> {
        if self.feature_names.is_empty() {
            return Err(PersistenceError::Corrupt("feature list is empty".to_string()));
        }
        if self.classifier.n_features() != self.feature_names.len() {
            return Err(PersistenceError::Corrupt(format!(
                "classifier expects {} features but {} names are stored",
                self.classifier.n_features(),
                self.feature_names.len()
            )));
        }
        self.classifier
            .validate()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Model v{} for sector {}: {} trees, {} samples, features [{}], created {}",
            self.version,
            self.sector_id,
            self.classifier.n_trees(),
            self.training_samples,
            self.feature_names.join(", "),
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

/// Errors that can occur during model persistence
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Corrupt model artifact: {0}")]
    Corrupt(String),
    #[error("Model version mismatch: expected v{expected}, found v{found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// File-backed store for a single model artifact.
#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize with bincode and replace the file atomically.
    pub fn save(&self, artifact: &ModelArtifact) -> Result<(), PersistenceError> {
        artifact.check_consistency()?;

        // Create parent directories if needed
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let bytes = bincode::serialize(artifact)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|source| PersistenceError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(
            path = %self.path.display(),
            features = artifact.feature_names.len(),
            "Saved model artifact"
        );
        Ok(())
    }

    /// Load the artifact. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<ModelArtifact>, PersistenceError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let artifact: ModelArtifact = bincode::deserialize(&bytes)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;

        // Version check
        if artifact.version != ModelArtifact::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: ModelArtifact::CURRENT_VERSION,
                found: artifact.version,
            });
        }
        artifact.check_consistency()?;

        Ok(Some(artifact))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ndarray::array;
    use tempfile::tempdir;

    use super::*;
    use crate::ml::forest::ForestBuilder;

    fn create_test_artifact() -> ModelArtifact {
        let records = array![[30.0, 6.0], [35.0, 7.0], [70.0, 6.0], [75.0, 14.0]];
        let forest = ForestBuilder::new()
            .n_trees(3)
            .fit(records.view(), &[1, 1, 0, 0])
            .unwrap();
        ModelArtifact::new(
            "S1",
            4,
            forest,
            vec!["Humidity".to_string(), "hour_of_day".to_string()],
            Utc.with_ymd_and_hms(2024, 6, 17, 10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("model.bin"));

        let artifact = create_test_artifact();
        store.save(&artifact).unwrap();

        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.version, ModelArtifact::CURRENT_VERSION);
        assert_eq!(loaded.feature_names, artifact.feature_names);
        assert_eq!(loaded.classifier, artifact.classifier);
        assert_eq!(loaded.sector_id, "S1");
        assert!(!dir.path().join("model.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("absent.bin"));

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"not a model").unwrap();

        let result = ModelStore::new(&path).load();

        assert!(matches!(result, Err(PersistenceError::Corrupt(_))));
    }

    #[test]
    fn test_load_truncated_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("model.bin"));
        store.save(&create_test_artifact()).unwrap();

        let bytes = fs::read(store.path()).unwrap();
        fs::write(store.path(), &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(store.load(), Err(PersistenceError::Corrupt(_))));
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let mut artifact = create_test_artifact();
        artifact.version = 99;
        fs::write(&path, bincode::serialize(&artifact).unwrap()).unwrap();

        let result = ModelStore::new(&path).load();

        assert!(matches!(
            result,
            Err(PersistenceError::VersionMismatch {
                expected: 1,
                found: 99
            })
        ));
    }

    #[test]
    fn test_load_rejects_malformed_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let mut artifact = create_test_artifact();

        // Still deserialises, but the first tree reads a column that does not exist
        let mut forest = serde_json::to_value(&artifact.classifier).unwrap();
        forest["trees"][0]["features"] = serde_json::json!([7]);
        artifact.classifier = serde_json::from_value(forest).unwrap();
        fs::write(&path, bincode::serialize(&artifact).unwrap()).unwrap();

        let result = ModelStore::new(&path).load();

        assert!(matches!(result, Err(PersistenceError::Corrupt(_))));
    }

    #[test]
    fn test_load_rejects_split_without_children() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let mut artifact = create_test_artifact();

        let mut forest = serde_json::to_value(&artifact.classifier).unwrap();
        let root = &mut forest["trees"][0]["tree"]["root_node"];
        root["leaf_node"] = serde_json::Value::Bool(false);
        root["left_child"] = serde_json::Value::Null;
        root["right_child"] = serde_json::Value::Null;
        artifact.classifier = serde_json::from_value(forest).unwrap();
        fs::write(&path, bincode::serialize(&artifact).unwrap()).unwrap();

        let mut ctx = crate::ml::ModelContext::new();
        let result = ctx.reload(&ModelStore::new(&path));

        assert!(matches!(result, Err(PersistenceError::Corrupt(_))));
        assert!(!ctx.is_trained());
    }

    #[test]
    fn test_save_rejects_inconsistent_artifact() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("model.bin"));
        let mut artifact = create_test_artifact();
        artifact.feature_names.push("day_of_week".to_string());

        assert!(matches!(store.save(&artifact), Err(PersistenceError::Corrupt(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("nested").join("dirs").join("model.bin"));

        store.save(&create_test_artifact()).unwrap();

        assert!(store.path().exists());
    }

    #[test]
    fn test_summary() {
        let summary = create_test_artifact().summary();

        assert!(summary.contains("sector S1"));
        assert!(summary.contains("3 trees"));
        assert!(summary.contains("Humidity, hour_of_day"));
    }
}
