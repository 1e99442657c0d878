//! Calibration orchestrator
//!
//! The one entry point for turning a method and its context into a
//! calibrated score. Each run constructs its own instance; nothing here is
//! process-global.

use super::aggregator::fuse;
use super::config::{config_hash, required_layers, IntrinsicCalibration, LayerConfig, MethodRole};
use super::layers::{self, InterplaySubgraph, MetaEvidence};
use super::{check_unit_interval, CalibrationResult, CalibrationSubject, ComputationGraph, ContextTuple, LayerId, LayerScore};
use crate::error::CalibrationError;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Minimum final score a method must reach
pub const CALIBRATION_THRESHOLD: f64 = 0.7;

/// Runtime data the layer computers need
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationContext {
    pub tuple: ContextTuple,
    pub graph: Option<ComputationGraph>,
    pub interplay: Option<InterplaySubgraph>,
    pub evidence: MetaEvidence,
}

impl CalibrationContext {
    pub fn new(tuple: ContextTuple) -> Self {
        Self {
            tuple,
            graph: None,
            interplay: None,
            evidence: MetaEvidence::default(),
        }
    }

    pub fn with_graph(mut self, graph: ComputationGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_interplay(mut self, interplay: InterplaySubgraph) -> Self {
        self.interplay = Some(interplay);
        self
    }

    pub fn with_evidence(mut self, evidence: MetaEvidence) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Full outcome of one calibration
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub method_id: String,
    pub role: MethodRole,
    pub is_executor: bool,
    pub required_layers: Vec<LayerId>,
    pub intrinsic_score: f64,
    /// Fused runtime aggregate over the required layers
    pub runtime: CalibrationResult,
    pub final_score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub config_hash: String,
}

pub struct CalibrationOrchestrator {
    intrinsic: IntrinsicCalibration,
    layers: LayerConfig,
    threshold: f64,
    config_hash: String,
}

impl CalibrationOrchestrator {
    /// Validate both documents and fingerprint them
    pub fn new(intrinsic: IntrinsicCalibration, layers: LayerConfig) -> Result<Self, CalibrationError> {
        intrinsic.validate()?;
        layers.validate()?;
        let config_hash = config_hash(&intrinsic, &layers)?;
        info!(
            methods = intrinsic.methods.len(),
            config_hash = %config_hash,
            "Calibration orchestrator initialized"
        );
        Ok(Self {
            intrinsic,
            layers,
            threshold: CALIBRATION_THRESHOLD,
            config_hash,
        })
    }

    pub fn from_paths(intrinsic_path: &Path, layer_config_path: &Path) -> Result<Self, CalibrationError> {
        Self::new(
            IntrinsicCalibration::load(intrinsic_path)?,
            LayerConfig::load(layer_config_path)?,
        )
    }

    pub fn with_threshold(mut self, threshold: f64) -> Result<Self, CalibrationError> {
        check_unit_interval("threshold", threshold)?;
        self.threshold = threshold;
        Ok(self)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn intrinsic(&self) -> &IntrinsicCalibration {
        &self.intrinsic
    }

    pub fn layer_config(&self) -> &LayerConfig {
        &self.layers
    }

    pub fn has_intrinsic(&self, method_id: &str) -> bool {
        self.intrinsic.methods.contains_key(method_id)
    }

    /// Role of a method; unspecified roles are full-context analyzers
    pub fn role_of(&self, method_id: &str) -> Result<MethodRole, CalibrationError> {
        self.intrinsic
            .methods
            .get(method_id)
            .map(|m| m.role.unwrap_or(MethodRole::ScoreQ))
            .ok_or_else(|| CalibrationError::MissingIntrinsicCalibration(method_id.to_string()))
    }

    /// Calibrated score; errors if below threshold
    pub fn calibrate(
        &self,
        method_id: &str,
        context: Option<&CalibrationContext>,
        is_executor: bool,
    ) -> Result<f64, CalibrationError> {
        Ok(self.calibrate_detailed(method_id, context, is_executor)?.final_score)
    }

    /// Like [`calibrate`](Self::calibrate) but returns the full report
    pub fn calibrate_detailed(
        &self,
        method_id: &str,
        context: Option<&CalibrationContext>,
        is_executor: bool,
    ) -> Result<CalibrationReport, CalibrationError> {
        let report = self.evaluate(method_id, context, is_executor)?;
        if !report.passed {
            warn!(
                method_id = %method_id,
                score = report.final_score,
                threshold = self.threshold,
                "Method failed calibration"
            );
            return Err(CalibrationError::BelowThreshold {
                method_id: method_id.to_string(),
                score: report.final_score,
                threshold: self.threshold,
            });
        }
        info!(method_id = %method_id, score = report.final_score, "Method calibrated");
        Ok(report)
    }

    /// Compute the report without enforcing the threshold
    pub fn evaluate(
        &self,
        method_id: &str,
        context: Option<&CalibrationContext>,
        is_executor: bool,
    ) -> Result<CalibrationReport, CalibrationError> {
        let intrinsic = self
            .intrinsic
            .methods
            .get(method_id)
            .ok_or_else(|| CalibrationError::MissingIntrinsicCalibration(method_id.to_string()))?;
        let role = intrinsic.role.unwrap_or(MethodRole::ScoreQ);
        let required = required_layers(role, is_executor);

        let base = layers::base_layer(intrinsic, &self.intrinsic.base_weights)?;
        let intrinsic_score = base.score();

        let context = context.ok_or_else(|| CalibrationError::InsufficientContext {
            method_id: method_id.to_string(),
            missing: "context tuple".to_string(),
        })?;

        let mut scores: BTreeMap<LayerId, LayerScore> = BTreeMap::new();
        scores.insert(LayerId::Base, base);
        for layer in required.iter().filter(|l| **l != LayerId::Base) {
            let score = self.compute_layer(*layer, method_id, role, context)?;
            debug!(method_id = %method_id, layer = %layer, score = score.score(), "Layer computed");
            scores.insert(*layer, score);
        }

        let (linear_weights, interactions) = if is_executor {
            (self.layers.fusion.linear.clone(), self.layers.fusion.interactions.as_slice())
        } else {
            (self.layers.fusion.normalized_over(&required)?, &[][..])
        };

        let subject = CalibrationSubject {
            method_id: method_id.to_string(),
            method_version: intrinsic.version.clone(),
            graph_fingerprint: context
                .graph
                .as_ref()
                .map(ComputationGraph::fingerprint)
                .unwrap_or_default(),
            subgraph_id: context.interplay.as_ref().map(|s| s.subgraph_id.clone()),
            context: context.tuple.clone(),
        };

        let mut metadata = Map::new();
        metadata.insert("role".to_string(), json!(role));
        metadata.insert("is_executor".to_string(), json!(is_executor));
        metadata.insert("config_hash".to_string(), json!(self.config_hash));
        metadata.insert(
            "aggregation".to_string(),
            Value::from(if is_executor { "linear_with_interactions" } else { "normalized_weighted_sum" }),
        );

        let runtime = fuse(subject, scores, &linear_weights, interactions, metadata)?;
        let final_score = (intrinsic_score + runtime.final_score()) / 2.0;
        check_unit_interval("final calibration score", final_score)?;

        Ok(CalibrationReport {
            method_id: method_id.to_string(),
            role,
            is_executor,
            required_layers: required.into_iter().collect(),
            intrinsic_score,
            runtime,
            final_score,
            threshold: self.threshold,
            passed: final_score >= self.threshold,
            config_hash: self.config_hash.clone(),
        })
    }

    fn compute_layer(
        &self,
        layer: LayerId,
        method_id: &str,
        role: MethodRole,
        context: &CalibrationContext,
    ) -> Result<LayerScore, CalibrationError> {
        let tuple = &context.tuple;
        match layer {
            LayerId::Base => Err(CalibrationError::Integrity(
                "base layer is computed from intrinsic data".to_string(),
            )),
            LayerId::Unit => layers::unit_layer(role, tuple.unit_quality(), &self.layers),
            LayerId::Question => layers::question_layer(method_id, tuple.question_id(), &self.layers),
            LayerId::Dimension => layers::dimension_layer(method_id, tuple.dimension(), &self.layers),
            LayerId::Policy => layers::policy_layer(method_id, tuple.policy_area(), &self.layers),
            LayerId::Congruence => {
                layers::congruence_layer(context.interplay.as_ref(), &self.layers.interplay_layer)
            }
            LayerId::Chain => {
                let graph = context.graph.as_ref().ok_or_else(|| CalibrationError::InsufficientContext {
                    method_id: method_id.to_string(),
                    missing: "computation graph".to_string(),
                })?;
                layers::chain_layer(method_id, graph, &self.layers.chain_layer)
            }
            LayerId::Meta => layers::meta_layer(&context.evidence, &self.layers.meta_layer),
        }
    }

    /// Methods calibrated and missing among `method_ids`
    pub fn coverage<'a>(&self, method_ids: impl IntoIterator<Item = &'a str>) -> (BTreeSet<String>, BTreeSet<String>) {
        method_ids
            .into_iter()
            .map(String::from)
            .partition(|id| self.has_intrinsic(id))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::calibration::config::{CompatibilityLevel, MethodCompatibility};

    pub const SCORER: &str = "analysis.Scorer.score";
    pub const WEAK: &str = "analysis.Weak.score";
    pub const LOADER: &str = "ingest.Loader.load";

    pub fn intrinsic() -> IntrinsicCalibration {
        IntrinsicCalibration::from_json_str(&format!(
            r#"{{
                "_base_weights": {{"w_th": 0.3, "w_imp": 0.4, "w_dep": 0.3}},
                "methods": {{
                    "{SCORER}": {{"b_theory": 0.9, "b_impl": 0.8, "b_deploy": 0.85, "role": "SCORE_Q"}},
                    "{WEAK}": {{"b_theory": 0.3, "b_impl": 0.3, "b_deploy": 0.3}},
                    "{LOADER}": {{"b_theory": 0.8, "b_impl": 0.9, "b_deploy": 0.9, "role": "INGEST_PDM"}}
                }}
            }}"#
        ))
        .unwrap()
    }

    pub fn layer_config() -> LayerConfig {
        let mut config = LayerConfig::default();
        for method in [SCORER, WEAK] {
            let mut compat = MethodCompatibility::default();
            compat.questions.insert("Q001".into(), CompatibilityLevel::Primary);
            compat.dimensions.insert("DIM01".into(), CompatibilityLevel::Primary);
            compat.policies.insert("PA01".into(), CompatibilityLevel::Primary);
            config.compatibility.insert(method.into(), compat);
        }
        config
    }

    pub fn graph() -> ComputationGraph {
        let mut g = ComputationGraph::default();
        g.nodes.extend([LOADER.to_string(), SCORER.to_string(), WEAK.to_string()]);
        g.edges.push((LOADER.into(), SCORER.into()));
        g.edges.push((LOADER.into(), WEAK.into()));
        g.required_inputs.insert(SCORER.into(), vec!["chunks".into()]);
        g
    }

    pub fn context() -> CalibrationContext {
        CalibrationContext::new(ContextTuple::new(Some("Q001"), "DIM01", "PA01", 0.9).unwrap())
            .with_graph(graph())
            .with_evidence(MetaEvidence::complete(20.0))
    }

    pub fn orchestrator() -> CalibrationOrchestrator {
        CalibrationOrchestrator::new(intrinsic(), layer_config()).unwrap()
    }
}
