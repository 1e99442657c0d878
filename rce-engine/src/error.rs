//! Engine error taxonomy
//!
//! One enum per failure class so callers can branch on cause:
//! - [`PlanError`]: construction invariants of execution plans
//! - [`ArchiveError`]: storage failures during plan archival
//! - [`ContractError`]: phase input/output contract and invariant failures
//! - [`CalibrationError`]: missing data, bad configuration, below-threshold scores
//! - [`RegistryError`]: method registration and gated invocation
//! - [`ProvenanceError`]: aggregation DAG violations
//! - [`UncertaintyError`]: degenerate uncertainty inputs
//! - [`AggregationError`]: hierarchical score aggregation
//! - [`ManifestError`]: verification manifest finalization

use thiserror::Error;

/// Execution plan construction failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Execution plan must contain exactly {expected} tasks, got {actual}")]
    TaskCount { expected: usize, actual: usize },

    #[error("Duplicate task ids in execution plan: {}", .0.join(", "))]
    DuplicateTaskIds(Vec<String>),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Integrity hash mismatch for plan {plan_id}: stored {stored}, computed {computed}")]
    IntegrityMismatch {
        plan_id: String,
        stored: String,
        computed: String,
    },
}

/// Plan archival failures (raised after rollback)
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A step of the write protocol failed
    #[error("Failed to archive plan {plan_id} during {step}: {message}")]
    Storage {
        plan_id: String,
        step: &'static str,
        message: String,
    },

    #[error("Archived plan not found: {0}")]
    NotFound(String),

    #[error("Archived plan {plan_id} is corrupt: {message}")]
    Corrupt { plan_id: String, message: String },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Phase contract failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("[{phase}] Input contract validation failed: {}", .errors.join("; "))]
    InputContract { phase: String, errors: Vec<String> },

    #[error("[{phase}] Output contract validation failed: {}", .errors.join("; "))]
    OutputContract { phase: String, errors: Vec<String> },

    #[error("[{phase}] Invariant violations: {}", .failures.join("; "))]
    InvariantViolation { phase: String, failures: Vec<String> },

    #[error("[{phase}] Execution failed: {message}")]
    Execution { phase: String, message: String },
}

impl ContractError {
    /// Phase that raised the error
    pub fn phase(&self) -> &str {
        match self {
            ContractError::InputContract { phase, .. }
            | ContractError::OutputContract { phase, .. }
            | ContractError::InvariantViolation { phase, .. }
            | ContractError::Execution { phase, .. } => phase,
        }
    }
}

/// Calibration failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Method {0} has no intrinsic calibration data")]
    MissingIntrinsicCalibration(String),

    #[error("Method {method_id} requires context for runtime layers: {missing}")]
    InsufficientContext { method_id: String, missing: String },

    #[error("Method {method_id} calibration {score:.4} is below threshold {threshold:.2}")]
    BelowThreshold {
        method_id: String,
        score: f64,
        threshold: f64,
    },

    #[error("Calibration configuration error: {0}")]
    Config(String),

    #[error("{what} = {value} is outside [0, 1]")]
    OutOfRange { what: String, value: f64 },

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Calibration result integrity violated: {0}")]
    Integrity(String),
}

/// Method registry failures
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    #[error("Method not registered: {0}")]
    UnknownMethod(String),

    #[error("Calibration gate rejected method: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Method {method_id} failed: {message}")]
    Execution { method_id: String, message: String },
}

/// Aggregation DAG failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvenanceError {
    #[error("Node already exists: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Weights length {weights} != sources length {sources}")]
    WeightMismatch { sources: usize, weights: usize },

    #[error("Aggregation {source_id} -> {target_id} would create a cycle")]
    CycleDetected { source_id: String, target_id: String },

    #[error("Invalid weights for {target_id}: {reason}")]
    InvalidWeights { target_id: String, reason: String },

    #[error("Contributions to {target_id} sum to {total}, cannot attribute score {score}")]
    DegenerateAttribution { target_id: String, total: f64, score: f64 },
}

/// Uncertainty quantification input failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UncertaintyError {
    #[error("Cannot quantify uncertainty of an empty score set")]
    Empty,

    #[error("Length mismatch: {scores} scores, {other} {what}")]
    LengthMismatch {
        scores: usize,
        other: usize,
        what: &'static str,
    },

    #[error("Weights must be non-negative with a positive sum")]
    InvalidWeights,

    #[error("At least 2 bootstrap samples are required, got {0}")]
    TooFewSamples(usize),
}

/// Hierarchical aggregation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("Nothing to aggregate into {0}")]
    NoSources(String),

    #[error("Score for {id} must lie in [0, 1], got {score}")]
    InvalidScore { id: String, score: f64 },

    #[error(transparent)]
    Provenance(#[from] ProvenanceError),

    #[error(transparent)]
    Uncertainty(#[from] UncertaintyError),
}

/// Roll-up behind the calibration gate
#[derive(Error, Debug)]
pub enum GatedAggregationError {
    #[error("Calibration gate rejected {method_id}: {source}")]
    GateRejected {
        method_id: String,
        #[source]
        source: RegistryError,
    },

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Verification manifest failures
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid HMAC key")]
    InvalidKey,

    #[error("Manifest I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
