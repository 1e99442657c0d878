//! Phase manifest
//!
//! The manifest is the only artifact phases communicate through outside
//! their typed inputs/outputs. Records are write-once: a phase name can be
//! recorded a single time per manifest. The one permitted amendment is
//! [`PhaseManifestBuilder::mark_failed`], which downgrades a successful
//! record when a pipeline-level structural check fails after the phase
//! finished. Failed records are never rewritten.

use super::contract::{ContractValidationResult, PhaseReport};
use chrono::{DateTime, Utc};
use rce_common::canonical::canonical_sha256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

/// Phase outcome as recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Success,
    Failed,
}

/// Contract summary stored per phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSummary {
    pub validation_passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl From<&ContractValidationResult> for ContractSummary {
    fn from(result: &ContractValidationResult) -> Self {
        Self {
            validation_passed: result.passed,
            errors: result.errors.clone(),
            warnings: result.warnings.clone(),
        }
    }
}

/// File produced by a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// One phase entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_name: String,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub input_contract: Option<ContractSummary>,
    pub output_contract: Option<ContractSummary>,
    pub invariants_checked: Vec<String>,
    pub invariants_satisfied: bool,
    pub artifacts: Vec<ArtifactRecord>,
    pub error: Option<String>,
}

/// Incrementally built phase manifest
#[derive(Debug, Clone, Default)]
pub struct PhaseManifestBuilder {
    records: Vec<PhaseRecord>,
}

impl PhaseManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a phase invocation
    ///
    /// Returns `false` (and leaves the manifest untouched) if the phase was
    /// already recorded.
    pub fn record_phase(&mut self, report: &PhaseReport, artifacts: Vec<ArtifactRecord>) -> bool {
        let name = &report.metadata.phase_name;
        if self.get(name).is_some() {
            warn!(phase = %name, "Phase already recorded in manifest; ignoring duplicate");
            return false;
        }

        self.records.push(PhaseRecord {
            phase_name: name.clone(),
            status: if report.metadata.success {
                PhaseStatus::Success
            } else {
                PhaseStatus::Failed
            },
            started_at: report.metadata.started_at,
            finished_at: report.metadata.finished_at,
            duration_ms: report.metadata.duration_ms,
            input_contract: report.input_validation.as_ref().map(ContractSummary::from),
            output_contract: report.output_validation.as_ref().map(ContractSummary::from),
            invariants_checked: report.invariants_checked.clone(),
            invariants_satisfied: report.invariants_satisfied,
            artifacts,
            error: report.metadata.error.clone(),
        });
        true
    }

    /// Downgrade a successful record to failed (structural post-condition)
    ///
    /// Returns `false` when the phase is unrecorded or already failed; the
    /// existing record is then left as written.
    pub fn mark_failed(&mut self, phase_name: &str, error: impl Into<String>) -> bool {
        let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.phase_name == phase_name && r.status == PhaseStatus::Success)
        else {
            warn!(phase = %phase_name, "No successful record to mark failed");
            return false;
        };
        record.status = PhaseStatus::Failed;
        record.invariants_satisfied = false;
        record.error = Some(error.into());
        true
    }

    pub fn get(&self, phase_name: &str) -> Option<&PhaseRecord> {
        self.records.iter().find(|r| r.phase_name == phase_name)
    }

    /// Phase records in execution order
    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn successful_phases(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == PhaseStatus::Success)
            .count()
    }

    pub fn failed_phases(&self) -> usize {
        self.records.len() - self.successful_phases()
    }

    /// True when at least one phase is recorded and all of them succeeded
    pub fn all_successful(&self) -> bool {
        !self.records.is_empty() && self.failed_phases() == 0
    }

    pub fn to_json(&self) -> Value {
        let phases: serde_json::Map<String, Value> = self
            .records
            .iter()
            .map(|r| (r.phase_name.clone(), json!(r)))
            .collect();
        json!({
            "phases": phases,
            "phase_order": self.records.iter().map(|r| r.phase_name.as_str()).collect::<Vec<_>>(),
            "total_phases": self.records.len(),
            "successful_phases": self.successful_phases(),
            "failed_phases": self.failed_phases(),
        })
    }

    /// Write the manifest as pretty JSON, creating parent directories
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(&self.to_json())?;
        tokio::fs::write(path, text).await
    }
}

/// SHA-256 of the canonical JSON form of a contract payload
pub fn compute_contract_hash<T: Serialize + ?Sized>(value: &T) -> rce_common::Result<String> {
    canonical_sha256(value)
}
