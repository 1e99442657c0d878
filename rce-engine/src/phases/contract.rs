//! Phase contract runtime
//!
//! Every pipeline stage implements [`PhaseContract`] and is driven through
//! [`run_phase`], which enforces the fixed sequence:
//! 1. Validate input (failure: body never runs)
//! 2. Execute
//! 3. Validate output
//! 4. Check every registered invariant, collecting all failures
//!
//! Whatever happens, a [`PhaseReport`] with timing and error text is
//! produced. Failures are returned as [`PhaseFailure`] and are never
//! downgraded to warnings.

use super::manifest::ArtifactRecord;
use crate::error::ContractError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rce_common::time;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, info};

/// Which side of a phase a validation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Input,
    Output,
}

/// Raw findings of a contract check, produced by phase implementations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractCheck {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ContractCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error when `condition` is false
    pub fn require(&mut self, condition: bool, message: impl Into<String>) -> &mut Self {
        if !condition {
            self.errors.push(message.into());
        }
        self
    }

    pub fn warn(&mut self, message: impl Into<String>) -> &mut Self {
        self.warnings.push(message.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of validating one side of a phase contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractValidationResult {
    pub passed: bool,
    pub contract_type: ContractKind,
    pub phase_name: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub validation_timestamp: DateTime<Utc>,
}

impl ContractValidationResult {
    fn from_check(phase_name: &str, kind: ContractKind, check: ContractCheck) -> Self {
        Self {
            passed: check.passed(),
            contract_type: kind,
            phase_name: phase_name.to_string(),
            errors: check.errors,
            warnings: check.warnings,
            validation_timestamp: time::now(),
        }
    }
}

/// Named boolean predicate over a phase output
pub struct PhaseInvariant<O> {
    pub name: String,
    pub description: String,
    pub error_message: String,
    check: Box<dyn Fn(&O) -> bool + Send + Sync>,
}

impl<O> PhaseInvariant<O> {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        error_message: impl Into<String>,
        check: impl Fn(&O) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            error_message: error_message.into(),
            check: Box::new(check),
        }
    }

    /// Evaluate the predicate; a panicking check counts as a failure
    fn evaluate(&self, output: &O) -> Result<(), String> {
        match catch_unwind(AssertUnwindSafe(|| (self.check)(output))) {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("{}: {}", self.name, self.error_message)),
            Err(_) => Err(format!("{}: Exception during check", self.name)),
        }
    }
}

impl<O> std::fmt::Debug for PhaseInvariant<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseInvariant")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Timing and outcome of one phase invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetadata {
    pub phase_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

/// Everything the manifest needs to know about one phase invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub metadata: PhaseMetadata,
    pub input_validation: Option<ContractValidationResult>,
    pub output_validation: Option<ContractValidationResult>,
    pub invariants_checked: Vec<String>,
    pub invariants_satisfied: bool,
}

/// Successful phase invocation
#[derive(Debug)]
pub struct PhaseRun<O> {
    pub output: O,
    pub report: PhaseReport,
}

/// Failed phase invocation; the report is always populated
#[derive(Debug)]
pub struct PhaseFailure {
    pub error: ContractError,
    pub report: PhaseReport,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for PhaseFailure {}

/// Contract implemented by every pipeline stage
///
/// Phases communicate only through `Input` and `Output`; there is no side
/// channel.
#[async_trait]
pub trait PhaseContract: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    /// Stable phase name used in errors and the manifest
    fn name(&self) -> &str;

    fn validate_input(&self, input: &Self::Input) -> ContractCheck;

    fn validate_output(&self, output: &Self::Output) -> ContractCheck;

    /// Phase body; I/O-bound sub-steps may suspend here
    async fn execute(&self, input: Self::Input) -> anyhow::Result<Self::Output>;

    /// Invariants checked after output validation
    fn invariants(&self) -> Vec<PhaseInvariant<Self::Output>> {
        Vec::new()
    }

    /// Files read or produced by a successful run, recorded in the manifest
    fn artifacts(&self, _output: &Self::Output) -> Vec<ArtifactRecord> {
        Vec::new()
    }
}

/// Drive one phase through validate → execute → validate → invariants
pub async fn run_phase<P>(phase: &P, input: P::Input) -> Result<PhaseRun<P::Output>, PhaseFailure>
where
    P: PhaseContract + ?Sized,
{
    let name = phase.name().to_string();
    let started_at = time::now();
    info!(phase = %name, "Phase started");

    let mut report = PhaseReport {
        metadata: PhaseMetadata {
            phase_name: name.clone(),
            started_at,
            finished_at: started_at,
            duration_ms: 0.0,
            success: false,
            error: None,
        },
        input_validation: None,
        output_validation: None,
        invariants_checked: Vec::new(),
        invariants_satisfied: false,
    };

    let outcome = run_steps(phase, &name, input, &mut report).await;

    let finished_at = time::now();
    report.metadata.finished_at = finished_at;
    report.metadata.duration_ms = time::elapsed_ms(&started_at, &finished_at);

    match outcome {
        Ok(output) => {
            report.metadata.success = true;
            info!(
                phase = %name,
                duration_ms = report.metadata.duration_ms,
                "Phase completed"
            );
            Ok(PhaseRun { output, report })
        }
        Err(error) => {
            report.metadata.error = Some(error.to_string());
            error!(phase = %name, error = %error, "Phase failed");
            Err(PhaseFailure { error, report })
        }
    }
}

async fn run_steps<P>(
    phase: &P,
    name: &str,
    input: P::Input,
    report: &mut PhaseReport,
) -> Result<P::Output, ContractError>
where
    P: PhaseContract + ?Sized,
{
    // Step 1: input contract
    let input_check =
        ContractValidationResult::from_check(name, ContractKind::Input, phase.validate_input(&input));
    let input_passed = input_check.passed;
    let input_errors = input_check.errors.clone();
    report.input_validation = Some(input_check);
    if !input_passed {
        return Err(ContractError::InputContract {
            phase: name.to_string(),
            errors: input_errors,
        });
    }

    // Step 2: execute
    let output = phase
        .execute(input)
        .await
        .map_err(|e| ContractError::Execution {
            phase: name.to_string(),
            message: format!("{:#}", e),
        })?;

    // Step 3: output contract
    let output_check = ContractValidationResult::from_check(
        name,
        ContractKind::Output,
        phase.validate_output(&output),
    );
    let output_passed = output_check.passed;
    let output_errors = output_check.errors.clone();
    report.output_validation = Some(output_check);
    if !output_passed {
        return Err(ContractError::OutputContract {
            phase: name.to_string(),
            errors: output_errors,
        });
    }

    // Step 4: invariants, all evaluated before raising
    let invariants = phase.invariants();
    let mut failures = Vec::new();
    for invariant in &invariants {
        report.invariants_checked.push(invariant.name.clone());
        if let Err(failure) = invariant.evaluate(&output) {
            debug!(phase = %name, invariant = %invariant.name, "Invariant failed");
            failures.push(failure);
        }
    }
    if !failures.is_empty() {
        return Err(ContractError::InvariantViolation {
            phase: name.to_string(),
            failures,
        });
    }
    report.invariants_satisfied = true;

    Ok(output)
}
