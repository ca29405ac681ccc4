use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::ml::features::FillPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub features: FeatureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/agricultural_system.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Where the trained classifier and its feature order are persisted
    pub path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/irrigation_model.bin"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    /// Share of rows held out for evaluation
    pub test_fraction: f64,
    /// Seed for the split and the bootstrap samples
    pub seed: u64,
    pub n_trees: usize,
    /// `None` grows every tree until its leaves are pure
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Weight classes inversely to their frequency
    pub class_balanced: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            class_balanced: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeatureConfig {
    pub fill_policy: FillPolicy,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DatabaseConfig::default().url);

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("irrigation-advisor");

        let training = TrainingConfig::default();

        let builder = Config::builder()
            // 1. Built-in defaults
            .set_default("database.url", database_url)?
            .set_default(
                "model.path",
                ModelConfig::default().path.to_string_lossy().to_string(),
            )?
            .set_default("training.test_fraction", training.test_fraction)?
            .set_default("training.seed", training.seed)?
            .set_default("training.n_trees", training.n_trees as u64)?
            .set_default("training.max_depth", None::<u64>)?
            .set_default("training.min_samples_split", training.min_samples_split as u64)?
            .set_default("training.class_balanced", training.class_balanced)?
            .set_default("features.fill_policy", "forward_backward")?

            // 2. Local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))

            // 3. User config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Environment variables (IRRIGATION__TRAINING__SEED=7)
            .add_source(Environment::with_prefix("IRRIGATION").separator("__"));

        let s = builder.build().context("Failed to assemble configuration")?;
        let config: Self = s
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.training.test_fraction > 0.0 && self.training.test_fraction < 1.0) {
            anyhow::bail!(
                "training.test_fraction must be in (0, 1), got {}",
                self.training.test_fraction
            );
        }
        if self.training.n_trees == 0 {
            anyhow::bail!("training.n_trees must be at least 1");
        }
        Ok(())
    }
}
