//! # Stage: Resilience
//!
//! ## Responsibility
//! Keep serving correct while parts of the system fail: per-backend circuit
//! breakers on the request path, and snapshot/restore of deployment and
//! ensemble state for recovery.
//!
//! ## Guarantees
//! - An open breaker rejects calls without touching the backend
//! - A half-open breaker admits exactly one trial call
//! - Snapshots never block the request path
//!
//! ## NOT Responsible For
//! - Choosing a fallback (that belongs to `routing`)
//! - Retrying calls (that belongs to `routing::retry`)

pub mod circuit_breaker;
pub mod recovery;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSettings, CircuitBreaker, CircuitBreakerError, CircuitBreakerStats,
    CircuitStatus,
};
pub use recovery::{
    ArtifactRecord, DisasterRecovery, RecoveryError, RecoverySettings, RecoverySnapshot,
    RestoreReport, SnapshotInfo,
};
