//! Hierarchical score aggregation
//!
//! Weighted means roll micro-question scores up through
//! dimension → policy area → cluster → macro. Every step is recorded in the
//! provenance DAG, classified with the quality rubric and carries bootstrap
//! uncertainty.

use crate::calibration::{AnalysisMethod, CalibrationContext, CalibrationOrchestrator, MethodRegistry};
use crate::error::{AggregationError, GatedAggregationError};
use crate::provenance::{AggregationDag, NodeLevel, ProvenanceNode};
use crate::uncertainty::{BootstrapAggregator, UncertaintyMetrics};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const EXCELENTE_THRESHOLD: f64 = 0.85;
pub const BUENO_THRESHOLD: f64 = 0.70;
pub const ACEPTABLE_THRESHOLD: f64 = 0.55;

/// Node id of the single top-level score
pub const MACRO_NODE_ID: &str = "MACRO";

const OPERATION: &str = "weighted_average";

/// Quality rubric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityLevel {
    Excelente,
    Bueno,
    Aceptable,
    Insuficiente,
}

impl QualityLevel {
    pub fn classify(score: f64) -> Self {
        if score >= EXCELENTE_THRESHOLD {
            QualityLevel::Excelente
        } else if score >= BUENO_THRESHOLD {
            QualityLevel::Bueno
        } else if score >= ACEPTABLE_THRESHOLD {
            QualityLevel::Aceptable
        } else {
            QualityLevel::Insuficiente
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excelente => "EXCELENTE",
            QualityLevel::Bueno => "BUENO",
            QualityLevel::Aceptable => "ACEPTABLE",
            QualityLevel::Insuficiente => "INSUFICIENTE",
        }
    }
}

/// One answered micro-question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroScore {
    pub question_id: String,
    pub dimension: String,
    pub policy_area: String,
    pub score: f64,
    #[serde(default = "unit_weight")]
    pub weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

/// Named group of policy areas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster_id: String,
    pub policy_areas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedScore {
    pub node_id: String,
    pub level: NodeLevel,
    pub score: f64,
    pub quality: QualityLevel,
    pub sources: Vec<String>,
    pub uncertainty: UncertaintyMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationReport {
    pub dimensions: Vec<AggregatedScore>,
    pub areas: Vec<AggregatedScore>,
    pub clusters: Vec<AggregatedScore>,
    #[serde(rename = "macro")]
    pub macro_score: AggregatedScore,
}

pub struct HierarchicalAggregator {
    dag: AggregationDag,
    bootstrap: BootstrapAggregator,
}

impl HierarchicalAggregator {
    pub fn new(bootstrap: BootstrapAggregator) -> Self {
        Self {
            dag: AggregationDag::new(),
            bootstrap,
        }
    }

    pub fn dag(&self) -> &AggregationDag {
        &self.dag
    }

    pub fn into_dag(self) -> AggregationDag {
        self.dag
    }

    pub fn add_micro(&mut self, micro: &MicroScore) -> Result<(), AggregationError> {
        if !(0.0..=1.0).contains(&micro.score) {
            return Err(AggregationError::InvalidScore {
                id: micro.question_id.clone(),
                score: micro.score,
            });
        }
        let node = ProvenanceNode::new(
            &micro.question_id,
            NodeLevel::Micro,
            micro.score,
            QualityLevel::classify(micro.score).as_str(),
        )
        .with_metadata("dimension", json!(micro.dimension))
        .with_metadata("policy_area", json!(micro.policy_area));
        self.dag.add_node(node)?;
        Ok(())
    }

    /// Weighted mean of existing nodes into a new node
    pub fn aggregate(
        &mut self,
        target_id: &str,
        level: NodeLevel,
        sources: &[(String, f64)],
    ) -> Result<AggregatedScore, AggregationError> {
        if sources.is_empty() {
            return Err(AggregationError::NoSources(target_id.to_string()));
        }

        let mut scores = Vec::with_capacity(sources.len());
        for (id, _) in sources {
            let node = self
                .dag
                .node(id)
                .ok_or_else(|| crate::error::ProvenanceError::UnknownNode(id.clone()))?;
            scores.push(node.score());
        }
        let weights: Vec<f64> = sources.iter().map(|(_, w)| *w).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || weights.iter().any(|w| *w < 0.0) {
            return Err(crate::error::UncertaintyError::InvalidWeights.into());
        }
        let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let score: f64 = normalized.iter().zip(&scores).map(|(w, s)| w * s).sum();

        let uncertainty = self.bootstrap.bootstrap_weighted_average(&scores, Some(&normalized))?;
        let quality = QualityLevel::classify(score);

        let node = ProvenanceNode::new(target_id, level, score, quality.as_str())
            .with_metadata("uncertainty", uncertainty.to_json());
        self.dag.add_node(node)?;
        let source_ids: Vec<&str> = sources.iter().map(|(id, _)| id.as_str()).collect();
        self.dag
            .add_aggregation_edge(&source_ids, target_id, OPERATION, &normalized, None)?;

        Ok(AggregatedScore {
            node_id: target_id.to_string(),
            level,
            score,
            quality,
            sources: sources.iter().map(|(id, _)| id.clone()).collect(),
            uncertainty,
        })
    }

    /// Full micro → macro roll-up
    ///
    /// Dimension nodes are keyed `{dimension}_{policy_area}`. Areas not named
    /// by any cluster feed the macro score directly, as do all areas when no
    /// clusters are given.
    pub fn run(
        &mut self,
        micro: &[MicroScore],
        clusters: &[ClusterSpec],
    ) -> Result<AggregationReport, AggregationError> {
        if micro.is_empty() {
            return Err(AggregationError::NoSources(MACRO_NODE_ID.to_string()));
        }

        let mut by_dimension: BTreeMap<(String, String), Vec<(String, f64)>> = BTreeMap::new();
        for m in micro {
            self.add_micro(m)?;
            by_dimension
                .entry((m.policy_area.clone(), m.dimension.clone()))
                .or_default()
                .push((m.question_id.clone(), m.weight));
        }

        let mut dimensions = Vec::new();
        let mut by_area: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
        for ((area, dimension), sources) in &by_dimension {
            let id = format!("{}_{}", dimension, area);
            dimensions.push(self.aggregate(&id, NodeLevel::Dimension, sources)?);
            by_area.entry(area.clone()).or_default().push((id, 1.0));
        }

        let mut areas = Vec::new();
        for (area, sources) in &by_area {
            areas.push(self.aggregate(area, NodeLevel::Area, sources)?);
        }

        let mut cluster_scores = Vec::new();
        let mut clustered = std::collections::BTreeSet::new();
        for cluster in clusters {
            let sources: Vec<(String, f64)> = cluster
                .policy_areas
                .iter()
                .filter(|pa| by_area.contains_key(*pa))
                .map(|pa| (pa.clone(), 1.0))
                .collect();
            clustered.extend(sources.iter().map(|(pa, _)| pa.clone()));
            cluster_scores.push(self.aggregate(&cluster.cluster_id, NodeLevel::Cluster, &sources)?);
        }

        let mut macro_sources: Vec<(String, f64)> =
            cluster_scores.iter().map(|c| (c.node_id.clone(), 1.0)).collect();
        macro_sources.extend(
            by_area
                .keys()
                .filter(|pa| !clustered.contains(*pa))
                .map(|pa| (pa.clone(), 1.0)),
        );
        let macro_score = self.aggregate(MACRO_NODE_ID, NodeLevel::Macro, &macro_sources)?;

        info!(
            micro = micro.len(),
            dimensions = dimensions.len(),
            areas = areas.len(),
            clusters = cluster_scores.len(),
            macro_score = macro_score.score,
            quality = macro_score.quality.as_str(),
            "Hierarchical aggregation complete"
        );

        Ok(AggregationReport {
            dimensions,
            areas,
            clusters: cluster_scores,
            macro_score,
        })
    }

    /// `run`, but only after `WeightedMeanMethod` passes the registry's
    /// calibration gate
    ///
    /// A rejected method leaves the DAG untouched. Returns the calibration
    /// score with the report.
    pub fn run_gated(
        &mut self,
        registry: &MethodRegistry,
        calibration: &CalibrationOrchestrator,
        context: Option<&CalibrationContext>,
        micro: &[MicroScore],
        clusters: &[ClusterSpec],
    ) -> Result<(f64, AggregationReport), GatedAggregationError> {
        if micro.is_empty() {
            return Err(AggregationError::NoSources(MACRO_NODE_ID.to_string()).into());
        }
        let method_id = WeightedMeanMethod::METHOD_ID;
        let scores: Vec<f64> = micro.iter().map(|m| m.score).collect();
        let weights: Vec<f64> = micro.iter().map(|m| m.weight).collect();
        let (calibration_score, _) = registry
            .invoke(
                calibration,
                method_id,
                context,
                &json!({ "scores": scores, "weights": weights }),
            )
            .map_err(|source| {
                warn!(method_id = %method_id, error = %source, "Roll-up blocked by calibration gate");
                GatedAggregationError::GateRejected {
                    method_id: method_id.to_string(),
                    source,
                }
            })?;
        info!(method_id = %method_id, calibration_score, "Aggregation method passed calibration");

        let report = self.run(micro, clusters)?;
        Ok((calibration_score, report))
    }
}

/// Registry-facing weighted mean: `{"scores": [..], "weights": [..]?}` → `{"score": x}`
pub struct WeightedMeanMethod;

impl WeightedMeanMethod {
    pub const METHOD_ID: &'static str = "aggregation.WeightedMean.aggregate";
}

impl AnalysisMethod for WeightedMeanMethod {
    fn method_id(&self) -> &str {
        Self::METHOD_ID
    }

    fn is_executor(&self) -> bool {
        true
    }

    fn execute(&self, input: &Value) -> anyhow::Result<Value> {
        let scores: Vec<f64> = serde_json::from_value(input["scores"].clone())?;
        let weights: Option<Vec<f64>> = match &input["weights"] {
            Value::Null => None,
            w => Some(serde_json::from_value(w.clone())?),
        };
        let (mean, _) = crate::uncertainty::propagate_weighted_average(
            &scores,
            &vec![0.0; scores.len()],
            weights.as_deref(),
        )?;
        Ok(json!({"score": mean}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uncertainty::DEFAULT_SEED;

    fn micro(q: &str, dim: &str, pa: &str, score: f64) -> MicroScore {
        MicroScore {
            question_id: q.into(),
            dimension: dim.into(),
            policy_area: pa.into(),
            score,
            weight: 1.0,
        }
    }

    fn aggregator() -> HierarchicalAggregator {
        HierarchicalAggregator::new(BootstrapAggregator::new(200, DEFAULT_SEED).unwrap())
    }

    #[test]
    fn test_quality_rubric() {
        assert_eq!(QualityLevel::classify(0.85), QualityLevel::Excelente);
        assert_eq!(QualityLevel::classify(0.849), QualityLevel::Bueno);
        assert_eq!(QualityLevel::classify(0.70), QualityLevel::Bueno);
        assert_eq!(QualityLevel::classify(0.55), QualityLevel::Aceptable);
        assert_eq!(QualityLevel::classify(0.54), QualityLevel::Insuficiente);
    }

    #[test]
    fn test_full_rollup() {
        let scores = vec![
            micro("Q001", "DIM01", "PA01", 0.9),
            micro("Q002", "DIM01", "PA01", 0.7),
            micro("Q003", "DIM02", "PA01", 0.6),
            micro("Q004", "DIM01", "PA02", 0.4),
            micro("Q005", "DIM01", "PA03", 1.0),
        ];
        let clusters = vec![ClusterSpec {
            cluster_id: "CL01".into(),
            policy_areas: vec!["PA01".into(), "PA02".into()],
        }];

        let mut agg = aggregator();
        let report = agg.run(&scores, &clusters).unwrap();

        assert_eq!(report.dimensions.len(), 4);
        let dim = report.dimensions.iter().find(|d| d.node_id == "DIM01_PA01").unwrap();
        assert!((dim.score - 0.8).abs() < 1e-12);

        let pa01 = report.areas.iter().find(|a| a.node_id == "PA01").unwrap();
        assert!((pa01.score - 0.7).abs() < 1e-12);

        // CL01 = mean(PA01 0.7, PA02 0.4); MACRO = mean(CL01, PA03)
        assert!((report.clusters[0].score - 0.55).abs() < 1e-12);
        assert!((report.macro_score.score - 0.775).abs() < 1e-12);
        assert_eq!(report.macro_score.quality, QualityLevel::Bueno);
        assert_eq!(report.macro_score.sources, vec!["CL01", "PA03"]);

        let dag = agg.dag();
        let lineage = dag.trace_lineage(MACRO_NODE_ID).unwrap();
        assert_eq!(lineage.micro_question_count, 5);
        assert_eq!(lineage.depth, 4);
        let attribution = dag.compute_attribution(MACRO_NODE_ID).unwrap();
        assert!((attribution.values().sum::<f64>() - 0.775).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_out_of_range_micro() {
        let mut agg = aggregator();
        let err = agg.run(&[micro("Q001", "DIM01", "PA01", 1.5)], &[]).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidScore { .. }));
    }

    #[test]
    fn test_empty_cluster_is_error() {
        let mut agg = aggregator();
        let clusters = vec![ClusterSpec {
            cluster_id: "CL09".into(),
            policy_areas: vec!["PA99".into()],
        }];
        let err = agg.run(&[micro("Q001", "DIM01", "PA01", 0.5)], &clusters).unwrap_err();
        assert_eq!(err, AggregationError::NoSources("CL09".into()));
    }

    #[test]
    fn test_weighted_mean_method() {
        let method = WeightedMeanMethod;
        let out = method
            .execute(&json!({"scores": [0.2, 0.8], "weights": [1.0, 3.0]}))
            .unwrap();
        assert!((out["score"].as_f64().unwrap() - 0.65).abs() < 1e-12);
        let out = method.execute(&json!({"scores": [0.2, 0.8]})).unwrap();
        assert!((out["score"].as_f64().unwrap() - 0.5).abs() < 1e-12);
        assert!(method.execute(&json!({"scores": []})).is_err());
    }
}
