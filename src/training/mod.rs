//! # Stage: Training
//!
//! ## Responsibility
//! Turn resolved predictions into labeled examples per lineage, retrain when
//! enough have accumulated, evaluate the candidate against the incumbent on
//! a deterministic holdout, and hand passing candidates to deployment.
//!
//! ## Guarantees
//! - One training run per lineage at a time
//! - The train/holdout split of an example never changes between runs
//! - A failed run returns the lineage to Collecting without losing valid examples
//! - Artifacts are checksummed when stored
//!
//! ## NOT Responsible For
//! - Traffic management (that belongs to `deployment`)
//! - Ground-truth reconciliation (that belongs to `feedback`)

pub mod artifacts;
pub mod dataset;
pub mod pipeline;
pub mod trainer;

pub use artifacts::{ArtifactRef, ArtifactStore};
pub use dataset::{DatasetSplit, DatasetStatistics, ExportFormat, LabeledExample};
pub use pipeline::{
    PipelineSnapshot, PipelineState, PipelineTransition, TrainingOutcome, TrainingPipeline,
    TrainingReport, TrainingSettings,
};
pub use trainer::{CalibratedPredictor, CalibrationTrainer, ModelArtifact, ModelMetrics, Trainer};

use crate::deployment::DeploymentError;
use thiserror::Error;

/// Errors from the training pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrainingError {
    /// Not enough usable examples.
    #[error("{lineage}: {have} usable examples, need {need}")]
    InsufficientData {
        /// Lineage.
        lineage: String,
        /// Examples available.
        have: usize,
        /// Examples required.
        need: usize,
    },

    /// The trainer failed.
    #[error("trainer error: {0}")]
    Trainer(String),

    /// Storing or loading an artifact failed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Dataset export failed.
    #[error("export error: {0}")]
    Export(String),

    /// The lineage has never received an example.
    #[error("unknown lineage: {0}")]
    UnknownLineage(String),

    /// The lineage is not ready to train.
    #[error("{lineage} is {} and cannot train", state.as_str())]
    NotReady {
        /// Lineage.
        lineage: String,
        /// Its state.
        state: PipelineState,
    },

    /// A run for the lineage is already in flight.
    #[error("training already running for {0}")]
    AlreadyTraining(String),

    /// Deployment refused the candidate.
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
}
