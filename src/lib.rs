//! Irrigation Advisor Library
//!
//! This module exposes the core components of the irrigation advisor:
//! the reading store, the hourly feature pipeline, training, prediction and
//! model persistence.

pub mod config;
pub mod db;
pub mod export;
pub mod ml;
pub mod simulation;
pub mod traits;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{
    Database, FieldValue, IrrigationEvent, PatchError, RecordKey, RecordPatch, SensorReading,
    Table,
};
pub use export::export_feature_matrix;
pub use ml::{
    FeatureBuilder, FillPolicy, IrrigationAction, ModelArtifact, ModelContext, ModelStore,
    PipelineError, Prediction, TrainingOutcome, predict, train,
};
pub use simulation::{SimulatedSensors, SimulationSummary, simulate_history};
pub use traits::{Clock, MemoryStore, MockClock, ReadingSink, ReadingStore, SystemClock};
