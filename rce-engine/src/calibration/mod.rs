//! Multi-layer calibration
//!
//! Turns heterogeneous per-layer signals about an analytical method into one
//! auditable score in [0, 1].
//!
//! # Architecture
//! - [`layers`]: eight pure layer computers
//! - [`aggregator`]: linear + pairwise weakest-link interaction fusion
//! - [`orchestrator`]: the single entry point, with pass/fail threshold
//! - [`registry`]: typed method registry gated by calibration
//! - [`config`]: JSON-backed configuration with weight validation and hashing

pub mod aggregator;
pub mod config;
pub mod layers;
pub mod orchestrator;
pub mod registry;

pub use aggregator::{fuse, InteractionTerm};
pub use config::{FusionWeights, IntrinsicCalibration, LayerConfig, MethodRole};
pub use orchestrator::{
    CalibrationContext, CalibrationOrchestrator, CalibrationReport, CALIBRATION_THRESHOLD,
};
pub use registry::{AnalysisMethod, MethodRegistry};

use crate::error::CalibrationError;
use rce_common::{sha256_hex, to_canonical_json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Tolerance for `final == linear + interaction`
pub const RESULT_TOLERANCE: f64 = 1e-6;

/// The eight calibration layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerId {
    /// Intrinsic quality
    #[serde(rename = "b")]
    Base,
    /// Unit-of-analysis sensitivity
    #[serde(rename = "u")]
    Unit,
    /// Question compatibility
    #[serde(rename = "q")]
    Question,
    /// Dimension compatibility
    #[serde(rename = "d")]
    Dimension,
    /// Policy-area compatibility
    #[serde(rename = "p")]
    Policy,
    /// Interplay congruence
    #[serde(rename = "C")]
    Congruence,
    /// Chain compatibility
    #[serde(rename = "chain")]
    Chain,
    /// Meta/governance
    #[serde(rename = "m")]
    Meta,
}

impl LayerId {
    pub const ALL: [LayerId; 8] = [
        LayerId::Base,
        LayerId::Unit,
        LayerId::Question,
        LayerId::Dimension,
        LayerId::Policy,
        LayerId::Congruence,
        LayerId::Chain,
        LayerId::Meta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerId::Base => "b",
            LayerId::Unit => "u",
            LayerId::Question => "q",
            LayerId::Dimension => "d",
            LayerId::Policy => "p",
            LayerId::Congruence => "C",
            LayerId::Chain => "chain",
            LayerId::Meta => "m",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.as_str())
    }
}

/// Where a method is being evaluated: (question, dimension, policy area, unit quality)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextTuple {
    question_id: Option<String>,
    dimension: String,
    policy_area: String,
    unit_quality: f64,
}

impl ContextTuple {
    /// Validate codes (`Q*`, `DIM*`, `PA*`) and unit quality in [0, 1]
    pub fn new(
        question_id: Option<&str>,
        dimension: &str,
        policy_area: &str,
        unit_quality: f64,
    ) -> Result<Self, CalibrationError> {
        if let Some(q) = question_id {
            if !q.starts_with('Q') || q.len() < 2 {
                return Err(CalibrationError::InvalidContext(format!(
                    "question_id must match Q*, got {}",
                    q
                )));
            }
        }
        if !dimension.starts_with("DIM") || dimension.len() <= 3 {
            return Err(CalibrationError::InvalidContext(format!(
                "dimension must match DIM*, got {}",
                dimension
            )));
        }
        if !policy_area.starts_with("PA") || policy_area.len() <= 2 {
            return Err(CalibrationError::InvalidContext(format!(
                "policy_area must match PA*, got {}",
                policy_area
            )));
        }
        check_unit_interval("unit_quality", unit_quality)?;

        Ok(Self {
            question_id: question_id.map(String::from),
            dimension: dimension.to_string(),
            policy_area: policy_area.to_string(),
            unit_quality,
        })
    }

    pub fn question_id(&self) -> Option<&str> {
        self.question_id.as_deref()
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn policy_area(&self) -> &str {
        &self.policy_area
    }

    pub fn unit_quality(&self) -> f64 {
        self.unit_quality
    }
}

/// Computation graph of method nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputationGraph {
    pub nodes: BTreeSet<String>,
    pub edges: Vec<(String, String)>,
    /// Inputs each node declares as required
    #[serde(default)]
    pub required_inputs: BTreeMap<String, Vec<String>>,
}

impl ComputationGraph {
    pub fn incoming(&self, node: &str) -> usize {
        self.edges.iter().filter(|(_, to)| to == node).count()
    }

    /// SHA-256 over sorted nodes and sorted edges
    pub fn fingerprint(&self) -> String {
        let mut edges: Vec<Value> = self.edges.iter().map(|(a, b)| json!([a, b])).collect();
        edges.sort_by_key(to_canonical_json);
        let value = json!({"nodes": self.nodes, "edges": edges});
        sha256_hex(to_canonical_json(&value).as_bytes())
    }
}

/// The (method, version, graph, subgraph, context) being calibrated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSubject {
    pub method_id: String,
    pub method_version: String,
    pub graph_fingerprint: String,
    pub subgraph_id: Option<String>,
    pub context: ContextTuple,
}

/// Score of one layer with its breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerScore {
    layer: LayerId,
    score: f64,
    components: BTreeMap<String, f64>,
    rationale: String,
    metadata: Map<String, Value>,
}

impl LayerScore {
    /// Rejects scores outside [0, 1] (no clamping)
    pub fn new(layer: LayerId, score: f64, rationale: impl Into<String>) -> Result<Self, CalibrationError> {
        check_unit_interval(&format!("{} score", layer), score)?;
        Ok(Self {
            layer,
            score,
            components: BTreeMap::new(),
            rationale: rationale.into(),
            metadata: Map::new(),
        })
    }

    pub fn with_component(mut self, name: impl Into<String>, value: f64) -> Self {
        self.components.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn components(&self) -> &BTreeMap<String, f64> {
        &self.components
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }
}

/// Fused calibration outcome
///
/// Invariant: `final_score == linear_contribution + interaction_contribution`
/// within [`RESULT_TOLERANCE`], every score in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationResult {
    subject: CalibrationSubject,
    layer_scores: BTreeMap<LayerId, LayerScore>,
    linear_contribution: f64,
    interaction_contribution: f64,
    final_score: f64,
    metadata: Map<String, Value>,
}

impl CalibrationResult {
    pub fn new(
        subject: CalibrationSubject,
        layer_scores: BTreeMap<LayerId, LayerScore>,
        linear_contribution: f64,
        interaction_contribution: f64,
        final_score: f64,
        metadata: Map<String, Value>,
    ) -> Result<Self, CalibrationError> {
        check_unit_interval("final_score", final_score)?;
        let sum = linear_contribution + interaction_contribution;
        if (sum - final_score).abs() > RESULT_TOLERANCE {
            return Err(CalibrationError::Integrity(format!(
                "linear {} + interaction {} = {} != final {}",
                linear_contribution, interaction_contribution, sum, final_score
            )));
        }
        for (layer, score) in &layer_scores {
            if *layer != score.layer() {
                return Err(CalibrationError::Integrity(format!(
                    "layer score for {} stored under {}",
                    score.layer(),
                    layer
                )));
            }
            check_unit_interval(&format!("{} score", layer), score.score())?;
        }

        Ok(Self {
            subject,
            layer_scores,
            linear_contribution,
            interaction_contribution,
            final_score,
            metadata,
        })
    }

    pub fn subject(&self) -> &CalibrationSubject {
        &self.subject
    }

    pub fn layer_scores(&self) -> &BTreeMap<LayerId, LayerScore> {
        &self.layer_scores
    }

    pub fn linear_contribution(&self) -> f64 {
        self.linear_contribution
    }

    pub fn interaction_contribution(&self) -> f64 {
        self.interaction_contribution
    }

    pub fn final_score(&self) -> f64 {
        self.final_score
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Audit certificate allowing the score to be recomputed from its parts
    pub fn to_certificate(&self) -> Value {
        let layers: Map<String, Value> = self
            .layer_scores
            .iter()
            .map(|(id, s)| {
                (
                    id.as_str().to_string(),
                    json!({
                        "score": s.score(),
                        "components": s.components(),
                        "rationale": s.rationale(),
                    }),
                )
            })
            .collect();
        json!({
            "method_id": self.subject.method_id,
            "method_version": self.subject.method_version,
            "graph_fingerprint": self.subject.graph_fingerprint,
            "subgraph_id": self.subject.subgraph_id,
            "context": self.subject.context,
            "layer_scores": layers,
            "linear_contribution": self.linear_contribution,
            "interaction_contribution": self.interaction_contribution,
            "final_score": self.final_score,
            "metadata": self.metadata,
        })
    }
}

pub(crate) fn check_unit_interval(what: &str, value: f64) -> Result<(), CalibrationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CalibrationError::OutOfRange {
            what: what.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ContextTuple {
        ContextTuple::new(Some("Q001"), "DIM01", "PA01", 0.8).unwrap()
    }

    fn subject() -> CalibrationSubject {
        CalibrationSubject {
            method_id: "m".to_string(),
            method_version: "1.0".to_string(),
            graph_fingerprint: ComputationGraph::default().fingerprint(),
            subgraph_id: None,
            context: context(),
        }
    }

    #[test]
    fn test_context_rejects_noncanonical_codes() {
        assert!(ContextTuple::new(Some("X1"), "DIM01", "PA01", 0.5).is_err());
        assert!(ContextTuple::new(None, "D01", "PA01", 0.5).is_err());
        assert!(ContextTuple::new(None, "DIM01", "P01", 0.5).is_err());
        assert!(ContextTuple::new(None, "DIM01", "PA01", 1.01).is_err());
        assert!(ContextTuple::new(None, "DIM01", "PA01", -0.01).is_err());
        assert!(ContextTuple::new(None, "DIM01", "PA01", f64::NAN).is_err());
        assert!(ContextTuple::new(None, "DIM06", "PA10", 0.0).is_ok());
    }

    #[test]
    fn test_layer_score_range() {
        assert!(LayerScore::new(LayerId::Base, 1.0, "").is_ok());
        assert!(matches!(
            LayerScore::new(LayerId::Base, 1.2, ""),
            Err(CalibrationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_result_requires_sum_identity() {
        let ok = CalibrationResult::new(subject(), BTreeMap::new(), 0.6, 0.1, 0.7, Map::new());
        assert!(ok.is_ok());

        let within = CalibrationResult::new(subject(), BTreeMap::new(), 0.6, 0.1, 0.7 + 5e-7, Map::new());
        assert!(within.is_ok());

        let mismatch = CalibrationResult::new(subject(), BTreeMap::new(), 0.6, 0.1, 0.71, Map::new());
        assert!(matches!(mismatch, Err(CalibrationError::Integrity(_))));

        let out_of_range = CalibrationResult::new(subject(), BTreeMap::new(), 1.0, 0.1, 1.1, Map::new());
        assert!(matches!(out_of_range, Err(CalibrationError::OutOfRange { .. })));
    }

    #[test]
    fn test_result_rejects_misfiled_layer() {
        let mut layers = BTreeMap::new();
        layers.insert(LayerId::Unit, LayerScore::new(LayerId::Base, 0.5, "").unwrap());
        let result = CalibrationResult::new(subject(), layers, 0.5, 0.0, 0.5, Map::new());
        assert!(matches!(result, Err(CalibrationError::Integrity(_))));
    }

    #[test]
    fn test_graph_fingerprint_ignores_edge_order() {
        let mut g1 = ComputationGraph::default();
        g1.nodes.extend(["a".to_string(), "b".to_string(), "c".to_string()]);
        g1.edges = vec![("a".into(), "b".into()), ("b".into(), "c".into())];
        let mut g2 = g1.clone();
        g2.edges.reverse();
        assert_eq!(g1.fingerprint(), g2.fingerprint());

        g2.edges.push(("a".into(), "c".into()));
        assert_ne!(g1.fingerprint(), g2.fingerprint());
    }

    #[test]
    fn test_layer_serialization_names() {
        assert_eq!(serde_json::to_value(LayerId::Congruence).unwrap(), json!("C"));
        assert_eq!(serde_json::to_value(LayerId::Chain).unwrap(), json!("chain"));
        assert_eq!(LayerId::Meta.to_string(), "@m");
    }
}
