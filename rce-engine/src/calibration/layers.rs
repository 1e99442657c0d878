//! Layer computers
//!
//! One pure function per calibration layer. Each takes the method data, the
//! relevant slice of the context and its configuration table, and returns a
//! [`LayerScore`] in [0, 1] or an error. None of them clamp: a value outside
//! the unit interval means the configuration is wrong.

use super::config::{
    BaseWeights, ChainLayerConfig, CompatibilityLevel, CompatibilityLevels, GFunctionKind,
    GFunctionSpec, InterplayLayerConfig, IntrinsicScores, LayerConfig, MetaLayerConfig,
    MethodRole,
};
use super::{check_unit_interval, ComputationGraph, LayerId, LayerScore};
use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Fusion rules an interplay subgraph may declare
pub const VALID_FUSION_RULES: [&str; 5] = ["weighted_average", "max", "min", "product", "custom"];

// ========================================
// @b - intrinsic quality
// ========================================

pub fn base_layer(scores: &IntrinsicScores, weights: &BaseWeights) -> Result<LayerScore, CalibrationError> {
    weights.validate()?;
    check_unit_interval("b_theory", scores.b_theory)?;
    check_unit_interval("b_impl", scores.b_impl)?;
    check_unit_interval("b_deploy", scores.b_deploy)?;

    let score = weights.w_th * scores.b_theory
        + weights.w_imp * scores.b_impl
        + weights.w_dep * scores.b_deploy;

    Ok(LayerScore::new(
        LayerId::Base,
        score,
        format!(
            "{}*theory + {}*impl + {}*deploy",
            weights.w_th, weights.w_imp, weights.w_dep
        ),
    )?
    .with_component("b_theory", scores.b_theory)
    .with_component("b_impl", scores.b_impl)
    .with_component("b_deploy", scores.b_deploy))
}

// ========================================
// @chain - wiring
// ========================================

pub fn chain_layer(
    method_id: &str,
    graph: &ComputationGraph,
    config: &ChainLayerConfig,
) -> Result<LayerScore, CalibrationError> {
    if !graph.nodes.contains(method_id) {
        return Err(CalibrationError::InvalidContext(format!(
            "method {} is not a node of the computation graph",
            method_id
        )));
    }

    let requires_inputs = graph
        .required_inputs
        .get(method_id)
        .map(|inputs| !inputs.is_empty())
        .unwrap_or(false);
    let incoming = graph.incoming(method_id);

    let (score, rule) = if requires_inputs && incoming == 0 {
        (config.hard_mismatch, "hard_mismatch")
    } else {
        (config.all_contracts_pass_no_warnings, "all_contracts_pass_no_warnings")
    };

    Ok(LayerScore::new(LayerId::Chain, score, format!("chain rule: {}", rule))?
        .with_component("incoming_edges", incoming as f64)
        .with_metadata("rule", json!(rule)))
}

// ========================================
// @u - unit-of-analysis sensitivity
// ========================================

/// Apply a transform shape to unit quality; fails if the result leaves [0, 1]
pub fn apply_g_function(spec: &GFunctionSpec, unit_quality: f64) -> Result<f64, CalibrationError> {
    let value = match spec.kind {
        GFunctionKind::Identity => unit_quality,
        GFunctionKind::Constant => spec.value,
        GFunctionKind::PiecewiseLinear => {
            if unit_quality < spec.abort_threshold {
                0.0
            } else {
                spec.slope * unit_quality + spec.offset
            }
        }
        GFunctionKind::Sigmoidal => 1.0 - (-spec.k * (unit_quality - spec.x0)).exp(),
    };

    if !(0.0..=1.0).contains(&value) {
        return Err(CalibrationError::Config(format!(
            "{:?} transform maps unit quality {} to {}, outside [0, 1]",
            spec.kind, unit_quality, value
        )));
    }
    Ok(value)
}

pub fn unit_layer(
    role: MethodRole,
    unit_quality: f64,
    config: &LayerConfig,
) -> Result<LayerScore, CalibrationError> {
    check_unit_interval("unit_quality", unit_quality)?;

    let Some(spec) = config.g_function_for(role) else {
        return LayerScore::new(LayerId::Unit, 1.0, "method is insensitive to unit quality");
    };

    let score = apply_g_function(spec, unit_quality)?;
    Ok(LayerScore::new(LayerId::Unit, score, format!("{:?} transform", spec.kind))?
        .with_component("unit_quality", unit_quality))
}

// ========================================
// @q, @d, @p - compatibility
// ========================================

fn compatibility_score(
    layer: LayerId,
    declared: Option<CompatibilityLevel>,
    target: &str,
    levels: &CompatibilityLevels,
) -> Result<LayerScore, CalibrationError> {
    let level = declared.unwrap_or(CompatibilityLevel::Undeclared);
    let rationale = match declared {
        Some(CompatibilityLevel::Undeclared) | None => {
            format!("no declared association with {}; undeclared penalty", target)
        }
        Some(level) => format!("{:?} association with {}", level, target),
    };
    Ok(LayerScore::new(layer, levels.value(level), rationale)?
        .with_metadata("level", json!(level)))
}

pub fn question_layer(
    method_id: &str,
    question_id: Option<&str>,
    config: &LayerConfig,
) -> Result<LayerScore, CalibrationError> {
    let declared = question_id.and_then(|q| {
        config
            .compatibility
            .get(method_id)
            .and_then(|c| c.questions.get(q).copied())
    });
    compatibility_score(
        LayerId::Question,
        declared,
        question_id.unwrap_or("<no question>"),
        &config.question_layer,
    )
}

pub fn dimension_layer(
    method_id: &str,
    dimension: &str,
    config: &LayerConfig,
) -> Result<LayerScore, CalibrationError> {
    let declared = config
        .compatibility
        .get(method_id)
        .and_then(|c| c.dimensions.get(dimension).copied());
    compatibility_score(LayerId::Dimension, declared, dimension, &config.dimension_layer)
}

pub fn policy_layer(
    method_id: &str,
    policy_area: &str,
    config: &LayerConfig,
) -> Result<LayerScore, CalibrationError> {
    let declared = config
        .compatibility
        .get(method_id)
        .and_then(|c| c.policies.get(policy_area).copied());
    compatibility_score(LayerId::Policy, declared, policy_area, &config.policy_layer)
}

// ========================================
// @C - interplay congruence
// ========================================

/// Output-range agreement across the methods of a subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAgreement {
    SameRange,
    Convertible,
    Incompatible,
}

/// Group of methods whose outputs are fused together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterplaySubgraph {
    pub subgraph_id: String,
    pub scale: ScaleAgreement,
    /// Semantic tags per participating method
    pub semantic_tags: BTreeMap<String, BTreeSet<String>>,
    pub fusion_rule: Option<String>,
    /// Whether the inputs the fusion rule needs are all present
    #[serde(default)]
    pub fusion_requirements_met: bool,
}

/// Jaccard index over the tag sets of every participant
///
/// Fewer than two participants, or no tags at all, count as full agreement.
pub fn semantic_overlap(tags: &BTreeMap<String, BTreeSet<String>>) -> f64 {
    if tags.len() < 2 {
        return 1.0;
    }
    let mut sets = tags.values();
    let Some(first) = sets.next() else {
        return 1.0;
    };
    let mut intersection = first.clone();
    let mut union = first.clone();
    for set in sets {
        intersection = intersection.intersection(set).cloned().collect();
        union.extend(set.iter().cloned());
    }
    if union.is_empty() {
        return 1.0;
    }
    intersection.len() as f64 / union.len() as f64
}

pub fn congruence_layer(
    interplay: Option<&InterplaySubgraph>,
    config: &InterplayLayerConfig,
) -> Result<LayerScore, CalibrationError> {
    let Some(subgraph) = interplay else {
        return LayerScore::new(
            LayerId::Congruence,
            config.default_when_not_in_interplay,
            "not part of an interplay subgraph",
        );
    };

    let c_scale = match subgraph.scale {
        ScaleAgreement::SameRange => config.scale.same_range,
        ScaleAgreement::Convertible => config.scale.convertible,
        ScaleAgreement::Incompatible => config.scale.incompatible,
    };
    let c_sem = semantic_overlap(&subgraph.semantic_tags);
    let valid_rule = subgraph
        .fusion_rule
        .as_deref()
        .map(|rule| VALID_FUSION_RULES.contains(&rule))
        .unwrap_or(false);
    let c_fusion = match (valid_rule, subgraph.fusion_requirements_met) {
        (true, true) => config.fusion.declared_and_satisfied,
        (true, false) => config.fusion.partially_satisfied,
        (false, _) => config.fusion.invalid,
    };

    Ok(LayerScore::new(
        LayerId::Congruence,
        c_scale * c_sem * c_fusion,
        format!("interplay subgraph {}", subgraph.subgraph_id),
    )?
    .with_component("c_scale", c_scale)
    .with_component("c_sem", c_sem)
    .with_component("c_fusion", c_fusion))
}

// ========================================
// @m - meta/governance
// ========================================

/// Governance evidence about a method execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaEvidence {
    pub formula_export_valid: bool,
    pub trace_complete: bool,
    pub logs_conform_schema: bool,
    pub version_tagged: bool,
    pub config_hash_matches: bool,
    pub signature_valid: bool,
    pub runtime_ms: Option<f64>,
}

impl MetaEvidence {
    /// Evidence with every condition satisfied
    pub fn complete(runtime_ms: f64) -> Self {
        Self {
            formula_export_valid: true,
            trace_complete: true,
            logs_conform_schema: true,
            version_tagged: true,
            config_hash_matches: true,
            signature_valid: true,
            runtime_ms: Some(runtime_ms),
        }
    }
}

fn count(conditions: [bool; 3]) -> usize {
    conditions.iter().filter(|c| **c).count()
}

pub fn meta_layer(evidence: &MetaEvidence, config: &MetaLayerConfig) -> Result<LayerScore, CalibrationError> {
    let transparency = config.transparency.for_count(count([
        evidence.formula_export_valid,
        evidence.trace_complete,
        evidence.logs_conform_schema,
    ]));
    let governance = config.governance.for_count(count([
        evidence.version_tagged,
        evidence.config_hash_matches,
        evidence.signature_valid,
    ]));

    let runtime = evidence.runtime_ms.unwrap_or(config.cost.default_runtime_ms);
    if runtime < 0.0 || !runtime.is_finite() {
        return Err(CalibrationError::InvalidContext(format!(
            "runtime_ms must be a non-negative number, got {}",
            runtime
        )));
    }
    let cost = if runtime < config.cost.fast_runtime_ms {
        config.cost.fast
    } else if runtime < config.cost.acceptable_runtime_ms {
        config.cost.acceptable
    } else {
        config.cost.slow
    };

    let w = &config.weights;
    let score = w.transparency * transparency + w.governance * governance + w.cost * cost;

    Ok(LayerScore::new(LayerId::Meta, score, "transparency, governance and cost")?
        .with_component("m_transp", transparency)
        .with_component("m_gov", governance)
        .with_component("m_cost", cost)
        .with_metadata("runtime_ms", json!(runtime)))
}
