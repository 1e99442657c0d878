//! Calibration configuration
//!
//! Two JSON documents drive calibration:
//! - **intrinsic**: per-method base-layer sub-scores plus the base weights
//! - **layer config**: transform shapes, discrete mappings, compatibility
//!   levels and the fusion weight table
//!
//! Every section has serde defaults so partial documents are accepted, but
//! [`LayerConfig::validate`] and [`IntrinsicCalibration::validate`] reject
//! values that would break the [0, 1] guarantees. Misconfiguration fails
//! loudly; nothing is clamped.

use super::{check_unit_interval, LayerId};
use crate::error::CalibrationError;
use rce_common::canonical::canonicalize;
use rce_common::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// Tolerance for weight normalization checks
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

// ========================================
// Roles and required layers
// ========================================

/// Method role; determines which layers apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodRole {
    #[serde(alias = "ingest")]
    IngestPdm,
    Structure,
    #[serde(alias = "extractor", alias = "processor")]
    Extract,
    #[serde(alias = "score", alias = "analyzer", alias = "core")]
    ScoreQ,
    Aggregate,
    Report,
    #[serde(alias = "utility", alias = "orchestrator")]
    MetaTool,
    Transform,
}

impl MethodRole {
    pub fn required_layers(&self) -> BTreeSet<LayerId> {
        use LayerId::*;
        let layers: &[LayerId] = match self {
            MethodRole::IngestPdm | MethodRole::Structure | MethodRole::Extract => {
                &[Base, Chain, Unit, Meta]
            }
            MethodRole::ScoreQ => &LayerId::ALL,
            MethodRole::Aggregate => &[Base, Chain, Dimension, Policy, Congruence, Meta],
            MethodRole::Report => &[Base, Chain, Congruence, Meta],
            MethodRole::MetaTool | MethodRole::Transform => &[Base, Chain, Meta],
        };
        layers.iter().copied().collect()
    }
}

/// Layers required for a method; executors always need all eight
pub fn required_layers(role: MethodRole, is_executor: bool) -> BTreeSet<LayerId> {
    if is_executor {
        LayerId::ALL.iter().copied().collect()
    } else {
        role.required_layers()
    }
}

// ========================================
// Intrinsic calibration
// ========================================

/// Base-layer weights (theory, implementation, deployment)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseWeights {
    pub w_th: f64,
    pub w_imp: f64,
    pub w_dep: f64,
}

impl Default for BaseWeights {
    fn default() -> Self {
        Self {
            w_th: 0.4,
            w_imp: 0.35,
            w_dep: 0.25,
        }
    }
}

impl BaseWeights {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (name, w) in [("w_th", self.w_th), ("w_imp", self.w_imp), ("w_dep", self.w_dep)] {
            check_unit_interval(name, w)?;
        }
        let total = self.w_th + self.w_imp + self.w_dep;
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(CalibrationError::Config(format!(
                "base weights must sum to 1.0, got {:.6}",
                total
            )));
        }
        Ok(())
    }
}

/// Intrinsic sub-scores of one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicScores {
    pub b_theory: f64,
    pub b_impl: f64,
    pub b_deploy: f64,
    /// Role; methods without one are treated as full-context analyzers
    #[serde(default)]
    pub role: Option<MethodRole>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Intrinsic calibration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    #[serde(rename = "_base_weights", default)]
    pub base_weights: BaseWeights,
    #[serde(default)]
    pub methods: BTreeMap<String, IntrinsicScores>,
}

impl IntrinsicCalibration {
    pub fn from_json_str(text: &str) -> Result<Self, CalibrationError> {
        let parsed: Self = serde_json::from_str(text)
            .map_err(|e| CalibrationError::Config(format!("invalid intrinsic calibration: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let text = read_config(path)?;
        let parsed = Self::from_json_str(&text)?;
        info!(path = %path.display(), methods = parsed.methods.len(), "Loaded intrinsic calibration");
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.base_weights.validate()?;
        for (method_id, scores) in &self.methods {
            for (name, v) in [
                ("b_theory", scores.b_theory),
                ("b_impl", scores.b_impl),
                ("b_deploy", scores.b_deploy),
            ] {
                check_unit_interval(&format!("{}.{}", method_id, name), v)?;
            }
        }
        Ok(())
    }
}

// ========================================
// Layer configuration
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainLayerConfig {
    pub hard_mismatch: f64,
    pub all_contracts_pass_no_warnings: f64,
}

impl Default for ChainLayerConfig {
    fn default() -> Self {
        Self {
            hard_mismatch: 0.0,
            all_contracts_pass_no_warnings: 1.0,
        }
    }
}

/// Shape of a unit-quality transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GFunctionKind {
    Identity,
    Constant,
    PiecewiseLinear,
    Sigmoidal,
}

/// Unit-quality transform and the roles it applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GFunctionSpec {
    #[serde(rename = "type")]
    pub kind: GFunctionKind,
    #[serde(default)]
    pub applicable_roles: Vec<MethodRole>,
    #[serde(default = "one")]
    pub value: f64,
    #[serde(default = "default_abort_threshold")]
    pub abort_threshold: f64,
    #[serde(default = "default_slope")]
    pub slope: f64,
    #[serde(default = "default_offset")]
    pub offset: f64,
    #[serde(default = "default_k")]
    pub k: f64,
    #[serde(default = "default_x0")]
    pub x0: f64,
}

impl GFunctionSpec {
    pub fn new(kind: GFunctionKind, applicable_roles: Vec<MethodRole>) -> Self {
        Self {
            kind,
            applicable_roles,
            value: one(),
            abort_threshold: default_abort_threshold(),
            slope: default_slope(),
            offset: default_offset(),
            k: default_k(),
            x0: default_x0(),
        }
    }
}

fn one() -> f64 {
    1.0
}
fn default_abort_threshold() -> f64 {
    0.3
}
fn default_slope() -> f64 {
    2.0
}
fn default_offset() -> f64 {
    -0.6
}
fn default_k() -> f64 {
    5.0
}
fn default_x0() -> f64 {
    0.5
}

/// Compatibility of a method with a question, dimension or policy area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityLevel {
    Primary,
    Secondary,
    Validator,
    Undeclared,
}

/// Numeric value of each compatibility level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityLevels {
    pub primary: f64,
    pub secondary: f64,
    pub validator: f64,
    pub undeclared: f64,
}

impl Default for CompatibilityLevels {
    fn default() -> Self {
        Self {
            primary: 1.0,
            secondary: 0.7,
            validator: 0.9,
            undeclared: 0.1,
        }
    }
}

impl CompatibilityLevels {
    pub fn value(&self, level: CompatibilityLevel) -> f64 {
        match level {
            CompatibilityLevel::Primary => self.primary,
            CompatibilityLevel::Secondary => self.secondary,
            CompatibilityLevel::Validator => self.validator,
            CompatibilityLevel::Undeclared => self.undeclared,
        }
    }

    fn validate(&self, layer: &str) -> Result<(), CalibrationError> {
        for (name, v) in [
            ("primary", self.primary),
            ("secondary", self.secondary),
            ("validator", self.validator),
            ("undeclared", self.undeclared),
        ] {
            check_unit_interval(&format!("{}.{}", layer, name), v)?;
        }
        let floor = self.primary.min(self.secondary).min(self.validator);
        if self.undeclared > floor {
            return Err(CalibrationError::Config(format!(
                "{}: undeclared ({}) must be the lowest compatibility value",
                layer, self.undeclared
            )));
        }
        Ok(())
    }
}

/// Declared associations of one method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodCompatibility {
    pub questions: BTreeMap<String, CompatibilityLevel>,
    pub dimensions: BTreeMap<String, CompatibilityLevel>,
    pub policies: BTreeMap<String, CompatibilityLevel>,
}

/// Scale agreement values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleValues {
    pub same_range: f64,
    pub convertible: f64,
    pub incompatible: f64,
}

impl Default for ScaleValues {
    fn default() -> Self {
        Self {
            same_range: 1.0,
            convertible: 0.8,
            incompatible: 0.0,
        }
    }
}

/// Fusion agreement values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionValues {
    pub declared_and_satisfied: f64,
    pub partially_satisfied: f64,
    pub invalid: f64,
}

impl Default for FusionValues {
    fn default() -> Self {
        Self {
            declared_and_satisfied: 1.0,
            partially_satisfied: 0.5,
            invalid: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterplayLayerConfig {
    pub default_when_not_in_interplay: f64,
    pub scale: ScaleValues,
    pub fusion: FusionValues,
}

impl Default for InterplayLayerConfig {
    fn default() -> Self {
        Self {
            default_when_not_in_interplay: 1.0,
            scale: ScaleValues::default(),
            fusion: FusionValues::default(),
        }
    }
}

/// Three-level step values for condition counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepLevels {
    pub all_three_conditions: f64,
    pub two_of_three: f64,
    pub one_of_three: f64,
    pub none: f64,
}

impl Default for StepLevels {
    fn default() -> Self {
        Self {
            all_three_conditions: 1.0,
            two_of_three: 0.8,
            one_of_three: 0.5,
            none: 0.0,
        }
    }
}

impl StepLevels {
    pub fn for_count(&self, satisfied: usize) -> f64 {
        match satisfied {
            n if n >= 3 => self.all_three_conditions,
            2 => self.two_of_three,
            1 => self.one_of_three,
            _ => self.none,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostLevels {
    pub fast: f64,
    pub acceptable: f64,
    pub slow: f64,
    pub fast_runtime_ms: f64,
    pub acceptable_runtime_ms: f64,
    /// Runtime assumed when evidence does not report one
    pub default_runtime_ms: f64,
}

impl Default for CostLevels {
    fn default() -> Self {
        Self {
            fast: 1.0,
            acceptable: 0.8,
            slow: 0.5,
            fast_runtime_ms: 50.0,
            acceptable_runtime_ms: 200.0,
            default_runtime_ms: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaWeights {
    pub transparency: f64,
    pub governance: f64,
    pub cost: f64,
}

impl Default for MetaWeights {
    fn default() -> Self {
        Self {
            transparency: 0.5,
            governance: 0.4,
            cost: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaLayerConfig {
    pub weights: MetaWeights,
    pub transparency: StepLevels,
    pub governance: StepLevels,
    pub cost: CostLevels,
}

/// One pairwise interaction term of the fusion table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionWeight {
    pub layers: (LayerId, LayerId),
    pub weight: f64,
    #[serde(default)]
    pub rationale: String,
}

/// Linear and interaction weights of the fusion formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub linear: BTreeMap<LayerId, f64>,
    pub interactions: Vec<InteractionWeight>,
}

impl Default for FusionWeights {
    fn default() -> Self {
        use LayerId::*;
        let linear = [
            (Base, 0.122951),
            (Unit, 0.098361),
            (Question, 0.081967),
            (Dimension, 0.065574),
            (Policy, 0.049180),
            (Congruence, 0.081967),
            (Chain, 0.065574),
            (Meta, 0.034426),
        ]
        .into_iter()
        .collect();
        let interactions = vec![
            InteractionWeight {
                layers: (Unit, Chain),
                weight: 0.15,
                rationale: "Plan quality only matters with sound wiring".to_string(),
            },
            InteractionWeight {
                layers: (Chain, Congruence),
                weight: 0.12,
                rationale: "Ensemble validity requires chain integrity".to_string(),
            },
            InteractionWeight {
                layers: (Question, Dimension),
                weight: 0.08,
                rationale: "Question-dimension alignment synergy".to_string(),
            },
            InteractionWeight {
                layers: (Dimension, Policy),
                weight: 0.05,
                rationale: "Dimension-policy coherence synergy".to_string(),
            },
        ];
        Self {
            linear,
            interactions,
        }
    }
}

impl FusionWeights {
    pub fn linear_sum(&self) -> f64 {
        self.linear.values().sum()
    }

    pub fn interaction_sum(&self) -> f64 {
        self.interactions.iter().map(|i| i.weight).sum()
    }

    /// Non-negative weights, Σ linear + Σ interaction = 1
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (layer, w) in &self.linear {
            if *w < 0.0 || !w.is_finite() {
                return Err(CalibrationError::Config(format!(
                    "linear weight for {} must be non-negative, got {}",
                    layer, w
                )));
            }
        }
        for term in &self.interactions {
            if term.weight < 0.0 || !term.weight.is_finite() {
                return Err(CalibrationError::Config(format!(
                    "interaction weight for ({}, {}) must be non-negative, got {}",
                    term.layers.0, term.layers.1, term.weight
                )));
            }
            if term.layers.0 == term.layers.1 {
                return Err(CalibrationError::Config(format!(
                    "interaction ({}, {}) must pair two distinct layers",
                    term.layers.0, term.layers.1
                )));
            }
        }
        let total = self.linear_sum() + self.interaction_sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(CalibrationError::Config(format!(
                "fusion weights must sum to 1.0: linear {:.6} + interaction {:.6} = {:.6}",
                self.linear_sum(),
                self.interaction_sum(),
                total
            )));
        }
        Ok(())
    }

    /// Linear weights restricted to `layers` and renormalized to sum to 1
    pub fn normalized_over(&self, layers: &BTreeSet<LayerId>) -> Result<BTreeMap<LayerId, f64>, CalibrationError> {
        let mut selected = BTreeMap::new();
        for layer in layers {
            let w = self.linear.get(layer).copied().ok_or_else(|| {
                CalibrationError::Config(format!("no linear weight configured for {}", layer))
            })?;
            selected.insert(*layer, w);
        }
        let total: f64 = selected.values().sum();
        if total <= 0.0 {
            return Err(CalibrationError::Config(
                "required layers have zero total weight".to_string(),
            ));
        }
        Ok(selected.into_iter().map(|(k, v)| (k, v / total)).collect())
    }
}

/// Complete layer configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub chain_layer: ChainLayerConfig,
    pub g_functions: BTreeMap<String, GFunctionSpec>,
    pub question_layer: CompatibilityLevels,
    pub dimension_layer: CompatibilityLevels,
    pub policy_layer: CompatibilityLevels,
    /// Declared method associations, keyed by method id
    pub compatibility: BTreeMap<String, MethodCompatibility>,
    pub interplay_layer: InterplayLayerConfig,
    pub meta_layer: MetaLayerConfig,
    pub fusion: FusionWeights,
}

impl Default for LayerConfig {
    fn default() -> Self {
        let mut g_functions = BTreeMap::new();
        g_functions.insert(
            "g_identity".to_string(),
            GFunctionSpec::new(
                GFunctionKind::Identity,
                vec![
                    MethodRole::IngestPdm,
                    MethodRole::Structure,
                    MethodRole::Extract,
                    MethodRole::ScoreQ,
                ],
            ),
        );
        Self {
            chain_layer: ChainLayerConfig::default(),
            g_functions,
            question_layer: CompatibilityLevels::default(),
            dimension_layer: CompatibilityLevels::default(),
            policy_layer: CompatibilityLevels::default(),
            compatibility: BTreeMap::new(),
            interplay_layer: InterplayLayerConfig::default(),
            meta_layer: MetaLayerConfig::default(),
            fusion: FusionWeights::default(),
        }
    }
}

impl LayerConfig {
    pub fn from_json_str(text: &str) -> Result<Self, CalibrationError> {
        let parsed: Self = serde_json::from_str(text)
            .map_err(|e| CalibrationError::Config(format!("invalid layer config: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let text = read_config(path)?;
        let parsed = Self::from_json_str(&text)?;
        info!(path = %path.display(), "Loaded layer configuration");
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        check_unit_interval("chain_layer.hard_mismatch", self.chain_layer.hard_mismatch)?;
        check_unit_interval(
            "chain_layer.all_contracts_pass_no_warnings",
            self.chain_layer.all_contracts_pass_no_warnings,
        )?;
        self.question_layer.validate("question_layer")?;
        self.dimension_layer.validate("dimension_layer")?;
        self.policy_layer.validate("policy_layer")?;

        let interplay = &self.interplay_layer;
        for (name, v) in [
            ("default_when_not_in_interplay", interplay.default_when_not_in_interplay),
            ("scale.same_range", interplay.scale.same_range),
            ("scale.convertible", interplay.scale.convertible),
            ("scale.incompatible", interplay.scale.incompatible),
            ("fusion.declared_and_satisfied", interplay.fusion.declared_and_satisfied),
            ("fusion.partially_satisfied", interplay.fusion.partially_satisfied),
            ("fusion.invalid", interplay.fusion.invalid),
        ] {
            check_unit_interval(&format!("interplay_layer.{}", name), v)?;
        }

        let meta = &self.meta_layer;
        let meta_total = meta.weights.transparency + meta.weights.governance + meta.weights.cost;
        if (meta_total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(CalibrationError::Config(format!(
                "meta_layer weights must sum to 1.0, got {:.6}",
                meta_total
            )));
        }
        if meta.cost.fast_runtime_ms > meta.cost.acceptable_runtime_ms {
            return Err(CalibrationError::Config(
                "meta_layer.cost: fast threshold exceeds acceptable threshold".to_string(),
            ));
        }

        let mut claimed: BTreeMap<MethodRole, &str> = BTreeMap::new();
        for (name, spec) in &self.g_functions {
            for role in &spec.applicable_roles {
                if let Some(other) = claimed.insert(*role, name) {
                    return Err(CalibrationError::Config(format!(
                        "role {:?} claimed by g-functions {} and {}",
                        role, other, name
                    )));
                }
            }
        }

        self.fusion.validate()
    }

    /// g-function applicable to a role, if any
    pub fn g_function_for(&self, role: MethodRole) -> Option<&GFunctionSpec> {
        self.g_functions
            .values()
            .find(|spec| spec.applicable_roles.contains(&role))
    }
}

/// `sha256:` + hex digest over the canonical JSON of both configuration documents
pub fn config_hash(
    intrinsic: &IntrinsicCalibration,
    layers: &LayerConfig,
) -> Result<String, CalibrationError> {
    #[derive(Serialize)]
    struct Snapshot<'a> {
        intrinsic: &'a IntrinsicCalibration,
        layers: &'a LayerConfig,
    }
    let canonical = canonicalize(&Snapshot { intrinsic, layers })
        .map_err(|e| CalibrationError::Config(format!("cannot serialize config: {}", e)))?;
    Ok(format!("sha256:{}", sha256_hex(canonical.as_bytes())))
}

fn read_config(path: &Path) -> Result<String, CalibrationError> {
    std::fs::read_to_string(path)
        .map_err(|e| CalibrationError::Config(format!("cannot read {}: {}", path.display(), e)))
}
