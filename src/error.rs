//! Error types for the auto-update pipeline.
//!
//! Candidate-level failures (`RejectionReason`) never abort a batch.
//! Cycle-level failures (`CycleError`) abort only the current cycle and leave
//! the engine on its last-known-good snapshot.

use thiserror::Error;

use crate::model::VersionId;

/// Transient failure while fetching a source. Retried with backoff.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("transport error for `{source_name}`: {message}")]
    Transport { source_name: String, message: String },

    #[error("unexpected HTTP status {status} for `{source_name}`")]
    Status { source_name: String, status: u16 },

    #[error("fetch of `{source_name}` timed out after {secs}s")]
    Timeout { source_name: String, secs: u64 },
}

/// Why a candidate was rejected. Recorded for audit, non-fatal to the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectionReason {
    #[error("syntax: {0}")]
    Syntax(String),

    #[error("performance: estimated cost {cost:.2}x baseline exceeds {limit:.2}x")]
    Performance { cost: f64, limit: f64 },

    #[error("false positive: match rate {rate:.4} exceeds ceiling {ceiling:.4}")]
    FalsePositive { rate: f64, ceiling: f64 },

    #[error("low confidence: score {score:.2} below {min:.2}")]
    LowConfidence { score: f32, min: f32 },

    #[error("stage timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Pattern Record Store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted store record at line {line}: {message}")]
    Corrupted { line: usize, message: String },
}

/// Version Control Ledger failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Optimistic concurrency: the delta was planned against a stale head.
    #[error("commit conflict: delta based on {expected} but head is {head}")]
    Conflict { expected: VersionId, head: VersionId },

    #[error("version {0} not found in history")]
    NotFound(VersionId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure to compile a version into a live snapshot.
#[derive(Error, Debug)]
pub enum IndexBuildError {
    #[error("pattern `{pattern}` failed to compile: {message}")]
    Compile { pattern: String, message: String },

    #[error("regex group `{group}` exceeds size limits: {message}")]
    GroupTooLarge { group: String, message: String },
}

/// Invalid configuration detected at load time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("duplicate source name `{0}`")]
    DuplicateSource(String),
}

/// Failure of one orchestrator cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    IndexBuild(#[from] IndexBuildError),

    #[error("rollback target missing: {0}")]
    RollbackTargetMissing(VersionId),

    #[error("emergency stop active: {0}")]
    EmergencyStop(String),

    #[error("stop requested")]
    Stopped,
}
