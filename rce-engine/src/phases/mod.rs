//! Staged execution with contract-enforced phase transitions

pub mod canonical;
pub mod collaborators;
pub mod contract;
pub mod manifest;
pub mod orchestrator;

pub use contract::{
    run_phase, ContractCheck, ContractKind, ContractValidationResult, PhaseContract,
    PhaseFailure, PhaseInvariant, PhaseMetadata, PhaseReport, PhaseRun,
};
pub use manifest::{compute_contract_hash, ArtifactRecord, PhaseManifestBuilder, PhaseStatus};
pub use orchestrator::{OrchestratorConfig, PhaseOrchestrator, PipelineEvent, PipelineOutputs, PipelineResult};
