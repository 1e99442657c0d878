//! # RCE Engine
//!
//! Evaluation core of the rubric calibration engine:
//! - [`plan`]: fixed-size execution plans and their archive
//! - [`phases`]: contract-enforced phases and the phase orchestrator
//! - [`calibration`]: eight-layer method calibration with a pass threshold
//! - [`provenance`]: aggregation DAG with lineage and attribution
//! - [`uncertainty`]: bootstrap and analytical uncertainty
//! - [`aggregation`]: micro → macro roll-up recorded in the DAG
//! - [`verification`]: HMAC-signed run manifest

pub mod aggregation;
pub mod calibration;
pub mod error;
pub mod phases;
pub mod plan;
pub mod provenance;
pub mod uncertainty;
pub mod verification;

pub use crate::error::{
    AggregationError, ArchiveError, CalibrationError, ContractError, GatedAggregationError,
    ManifestError, PlanError, ProvenanceError, RegistryError, UncertaintyError,
};
