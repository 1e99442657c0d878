//! Layer fusion
//!
//! `Cal = Σ wℓ·xℓ + Σ wℓk·min(xℓ, xk)`
//!
//! This is the documented linear-plus-pairwise-interaction form, not a
//! capacity-based Choquet integral. Each interaction term is bounded by the
//! weaker of its two layers.

use super::config::InteractionWeight;
use super::{CalibrationResult, CalibrationSubject, LayerId, LayerScore, RESULT_TOLERANCE};
use crate::error::CalibrationError;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Evaluated interaction term
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionTerm {
    pub layers: (LayerId, LayerId),
    pub weight: f64,
    pub weakest: f64,
    pub contribution: f64,
    pub rationale: String,
}

impl InteractionTerm {
    /// `weight * min(x, y)`
    pub fn evaluate(spec: &InteractionWeight, x: f64, y: f64) -> Self {
        let weakest = x.min(y);
        Self {
            layers: spec.layers,
            weight: spec.weight,
            weakest,
            contribution: spec.weight * weakest,
            rationale: spec.rationale.clone(),
        }
    }
}

fn score_of(scores: &BTreeMap<LayerId, LayerScore>, layer: LayerId) -> Result<f64, CalibrationError> {
    scores
        .get(&layer)
        .map(LayerScore::score)
        .ok_or_else(|| CalibrationError::Integrity(format!("no score computed for layer {}", layer)))
}

/// Fuse layer scores into a [`CalibrationResult`]
///
/// Every weighted layer must have a score; a missing layer is an error, never
/// an implicit zero.
pub fn fuse(
    subject: CalibrationSubject,
    layer_scores: BTreeMap<LayerId, LayerScore>,
    linear_weights: &BTreeMap<LayerId, f64>,
    interactions: &[InteractionWeight],
    mut metadata: Map<String, Value>,
) -> Result<CalibrationResult, CalibrationError> {
    let mut linear = 0.0;
    let mut linear_terms = Map::new();
    for (layer, weight) in linear_weights {
        let contribution = weight * score_of(&layer_scores, *layer)?;
        linear += contribution;
        linear_terms.insert(layer.as_str().to_string(), json!(contribution));
    }

    let mut terms = Vec::with_capacity(interactions.len());
    for spec in interactions {
        let x = score_of(&layer_scores, spec.layers.0)?;
        let y = score_of(&layer_scores, spec.layers.1)?;
        terms.push(InteractionTerm::evaluate(spec, x, y));
    }
    let interaction: f64 = terms.iter().map(|t| t.contribution).sum();

    let raw = linear + interaction;
    // weights sum to 1 only within tolerance, so a perfect score may overshoot by float noise
    let final_score = if raw > 1.0 && raw - 1.0 <= RESULT_TOLERANCE { 1.0 } else { raw };

    metadata.insert("linear_terms".to_string(), Value::Object(linear_terms));
    metadata.insert("interaction_terms".to_string(), json!(terms));

    CalibrationResult::new(subject, layer_scores, linear, interaction, final_score, metadata)
}
