//! # Stage: Deployment
//!
//! ## Responsibility
//! Keep the registry of model versions per lineage, move traffic between them
//! (canary, full rollout, rollback), watch live accuracy and drift, and
//! publish every traffic change as a complete new routing table.
//!
//! ## Guarantees
//! - Traffic of every lineage sums to 100 after each change
//! - Atomic publication: readers see the old table or the new one, never a mix
//! - At most one rollout per lineage at a time
//! - Retired descriptors are kept for audit and rollback
//!
//! ## NOT Responsible For
//! - Training candidates (that belongs to `training`)
//! - Calling backends (that belongs to `routing`)

pub mod descriptor;
pub mod drift;
pub mod manager;

pub use descriptor::{ModelDescriptor, ModelStatus};
pub use drift::{DriftAlert, DriftDetector, DriftSettings};
pub use manager::{
    DeploymentEvent, DeploymentManager, DeploymentSettings, EvaluationSummary, LineageStatus,
    RolloutPhase, RolloutStatus, TransitionRecord, VariantMetrics,
};

use thiserror::Error;

/// Errors returned by the deployment manager.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeploymentError {
    /// The lineage has no active version.
    #[error("unknown lineage: {0}")]
    UnknownLineage(String),

    /// No such version in the lineage.
    #[error("unknown version {lineage}@{version}")]
    UnknownVersion {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },

    /// The version tag is already taken.
    #[error("version {lineage}@{version} already exists")]
    DuplicateVersion {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
    },

    /// Another candidate of the lineage is rolling out.
    #[error("rollout already in progress for {0}")]
    RolloutInProgress(String),

    /// Nothing is rolling out for the lineage.
    #[error("no rollout in progress for {0}")]
    NoRollout(String),

    /// The operation does not apply to a version in this status.
    #[error("{lineage}@{version} is {status:?}")]
    InvalidState {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
        /// Its status.
        status: ModelStatus,
    },

    /// The candidate is worse than allowed.
    #[error("{lineage}@{version} regressed: accuracy {candidate:.3} < required {required:.3}")]
    EvaluationRegression {
        /// Lineage.
        lineage: String,
        /// Version.
        version: String,
        /// Candidate accuracy.
        candidate: f64,
        /// Bar it had to clear.
        required: f64,
    },

    /// The backend key is not registered.
    #[error("backend not registered: {0}")]
    BackendMissing(String),
}
