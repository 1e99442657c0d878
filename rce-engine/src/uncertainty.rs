//! Uncertainty quantification for weighted aggregation
//!
//! - [`BootstrapAggregator`]: seeded resampling, percentile confidence
//!   intervals, epistemic vs aleatoric decomposition
//! - [`propagate_weighted_average`]: closed-form mean/std under independence
//! - [`sobol_indices`]: first-order sensitivity by perturbing one input at a time
//!
//! Everything is deterministic for a fixed seed and identical inputs.

use crate::error::UncertaintyError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::f64::consts::PI;
use tracing::debug;

pub const DEFAULT_BOOTSTRAP_SAMPLES: usize = 1000;
pub const DEFAULT_SEED: u64 = 42;
/// Coefficient of variation above which a score is flagged
pub const HIGH_UNCERTAINTY_CV: f64 = 0.3;
/// Ratio one uncertainty type must exceed the other by to dominate
pub const DOMINANCE_RATIO: f64 = 1.2;
/// Relative noise applied per input in sensitivity analysis
pub const SOBOL_NOISE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DominantUncertainty {
    Epistemic,
    Aleatoric,
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UncertaintyMetrics {
    pub mean: f64,
    pub std: f64,
    pub variance: f64,
    pub confidence_interval_95: (f64, f64),
    pub confidence_interval_99: (f64, f64),
    /// Spread of the bootstrap aggregates
    pub epistemic_uncertainty: f64,
    /// Spread of the raw inputs
    pub aleatoric_uncertainty: f64,
    /// `std / mean`, +∞ when the mean is 0
    pub coefficient_of_variation: f64,
    pub skewness: f64,
    /// Excess kurtosis
    pub kurtosis: f64,
    pub n_scores: usize,
    pub n_bootstrap_samples: usize,
}

impl UncertaintyMetrics {
    pub fn is_high_uncertainty(&self, threshold: f64) -> bool {
        self.coefficient_of_variation > threshold
    }

    pub fn dominant_uncertainty_type(&self) -> DominantUncertainty {
        if self.epistemic_uncertainty > self.aleatoric_uncertainty * DOMINANCE_RATIO {
            DominantUncertainty::Epistemic
        } else if self.aleatoric_uncertainty > self.epistemic_uncertainty * DOMINANCE_RATIO {
            DominantUncertainty::Aleatoric
        } else {
            DominantUncertainty::Balanced
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mean": self.mean,
            "std": self.std,
            "variance": self.variance,
            "confidence_interval_95": [self.confidence_interval_95.0, self.confidence_interval_95.1],
            "confidence_interval_99": [self.confidence_interval_99.0, self.confidence_interval_99.1],
            "epistemic_uncertainty": self.epistemic_uncertainty,
            "aleatoric_uncertainty": self.aleatoric_uncertainty,
            // JSON has no infinity
            "coefficient_of_variation": if self.coefficient_of_variation.is_finite() {
                json!(self.coefficient_of_variation)
            } else {
                Value::Null
            },
            "skewness": self.skewness,
            "kurtosis": self.kurtosis,
            "is_high_uncertainty": self.is_high_uncertainty(HIGH_UNCERTAINTY_CV),
            "dominant_uncertainty": self.dominant_uncertainty_type(),
            "n_scores": self.n_scores,
            "n_bootstrap_samples": self.n_bootstrap_samples,
        })
    }
}

// ========================================
// Descriptive statistics
// ========================================

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (ddof = 1); 0 for fewer than two values
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

fn central_moment(values: &[f64], m: f64, k: i32) -> f64 {
    values.iter().map(|v| (v - m).powi(k)).sum::<f64>() / values.len() as f64
}

/// Biased (population) skewness; 0 for a degenerate distribution
fn skewness(values: &[f64]) -> f64 {
    let m = mean(values);
    let m2 = central_moment(values, m, 2);
    if m2 <= 0.0 {
        return 0.0;
    }
    central_moment(values, m, 3) / m2.powf(1.5)
}

/// Biased excess kurtosis; 0 for a degenerate distribution
fn excess_kurtosis(values: &[f64]) -> f64 {
    let m = mean(values);
    let m2 = central_moment(values, m, 2);
    if m2 <= 0.0 {
        return 0.0;
    }
    central_moment(values, m, 4) / (m2 * m2) - 3.0
}

/// Percentile with linear interpolation between order statistics
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Weights normalized to sum to 1; uniform when absent
fn normalized_weights(n: usize, weights: Option<&[f64]>) -> Result<Vec<f64>, UncertaintyError> {
    let Some(weights) = weights else {
        return Ok(vec![1.0 / n as f64; n]);
    };
    if weights.len() != n {
        return Err(UncertaintyError::LengthMismatch {
            scores: n,
            other: weights.len(),
            what: "weights",
        });
    }
    let total: f64 = weights.iter().sum();
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) || total <= 0.0 {
        return Err(UncertaintyError::InvalidWeights);
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Standard normal draw (Box–Muller)
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

// ========================================
// Bootstrap
// ========================================

pub struct BootstrapAggregator {
    n_samples: usize,
    seed: u64,
}

impl Default for BootstrapAggregator {
    fn default() -> Self {
        Self {
            n_samples: DEFAULT_BOOTSTRAP_SAMPLES,
            seed: DEFAULT_SEED,
        }
    }
}

impl BootstrapAggregator {
    pub fn new(n_samples: usize, seed: u64) -> Result<Self, UncertaintyError> {
        if n_samples < 2 {
            return Err(UncertaintyError::TooFewSamples(n_samples));
        }
        Ok(Self { n_samples, seed })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Bootstrap the weighted average of `scores`
    ///
    /// Each resample draws `n` indices with replacement and renormalizes the
    /// drawn weights. A resample that draws only zero-weight inputs falls
    /// back to the plain mean of the drawn scores.
    pub fn bootstrap_weighted_average(
        &self,
        scores: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<UncertaintyMetrics, UncertaintyError> {
        if scores.is_empty() {
            return Err(UncertaintyError::Empty);
        }
        let n = scores.len();
        let weights = normalized_weights(n, weights)?;

        // fresh generator per call so repeated calls agree
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut resamples = Vec::with_capacity(self.n_samples);
        for _ in 0..self.n_samples {
            let mut weighted = 0.0;
            let mut weight_total = 0.0;
            let mut plain = 0.0;
            for _ in 0..n {
                let i = rng.gen_range(0..n);
                weighted += scores[i] * weights[i];
                weight_total += weights[i];
                plain += scores[i];
            }
            resamples.push(if weight_total > 0.0 {
                weighted / weight_total
            } else {
                plain / n as f64
            });
        }

        let m = mean(&resamples);
        let std = sample_std(&resamples);
        let mut sorted = resamples.clone();
        sorted.sort_by(f64::total_cmp);

        let metrics = UncertaintyMetrics {
            mean: m,
            std,
            variance: std * std,
            confidence_interval_95: (percentile(&sorted, 2.5), percentile(&sorted, 97.5)),
            confidence_interval_99: (percentile(&sorted, 0.5), percentile(&sorted, 99.5)),
            epistemic_uncertainty: std,
            aleatoric_uncertainty: sample_std(scores),
            coefficient_of_variation: if m != 0.0 { std / m } else { f64::INFINITY },
            skewness: skewness(&resamples),
            kurtosis: excess_kurtosis(&resamples),
            n_scores: n,
            n_bootstrap_samples: self.n_samples,
        };
        debug!(
            mean = metrics.mean,
            std = metrics.std,
            ci95_lower = metrics.confidence_interval_95.0,
            ci95_upper = metrics.confidence_interval_95.1,
            "Bootstrap complete"
        );
        Ok(metrics)
    }
}

/// Point estimate plus bootstrap metrics
pub fn aggregate_with_uncertainty(
    scores: &[f64],
    weights: Option<&[f64]>,
    n_bootstrap: usize,
    seed: u64,
) -> Result<(f64, UncertaintyMetrics), UncertaintyError> {
    let metrics = BootstrapAggregator::new(n_bootstrap, seed)?.bootstrap_weighted_average(scores, weights)?;
    Ok((metrics.mean, metrics))
}

// ========================================
// Analytical propagation
// ========================================

/// `mean = Σ wᵢxᵢ`, `var = Σ wᵢ²σᵢ²`, assuming independent inputs
pub fn propagate_weighted_average(
    scores: &[f64],
    std_devs: &[f64],
    weights: Option<&[f64]>,
) -> Result<(f64, f64), UncertaintyError> {
    if scores.is_empty() {
        return Err(UncertaintyError::Empty);
    }
    if std_devs.len() != scores.len() {
        return Err(UncertaintyError::LengthMismatch {
            scores: scores.len(),
            other: std_devs.len(),
            what: "uncertainties",
        });
    }
    let weights = normalized_weights(scores.len(), weights)?;

    let mean: f64 = weights.iter().zip(scores).map(|(w, x)| w * x).sum();
    let variance: f64 = weights.iter().zip(std_devs).map(|(w, s)| w * w * s * s).sum();
    Ok((mean, variance.sqrt()))
}

// ========================================
// Sensitivity
// ========================================

/// First-order sensitivity of a weighted average to each input
///
/// Input `i` is perturbed with Gaussian noise of std `0.2·|xᵢ|` while the
/// others are held fixed; the resulting output variances are normalized to
/// sum to 1 (left as-is when all are zero).
pub fn sobol_indices(
    scores: &[f64],
    weights: &[f64],
    n_samples: usize,
    seed: u64,
) -> Result<Vec<f64>, UncertaintyError> {
    if scores.is_empty() {
        return Err(UncertaintyError::Empty);
    }
    if n_samples < 2 {
        return Err(UncertaintyError::TooFewSamples(n_samples));
    }
    let weights = normalized_weights(scores.len(), Some(weights))?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices = Vec::with_capacity(scores.len());
    for (i, score) in scores.iter().enumerate() {
        let sigma = SOBOL_NOISE * score.abs();
        if sigma == 0.0 {
            indices.push(0.0);
            continue;
        }
        // the held-fixed inputs only shift the output, so the variance is
        // that of the perturbation term
        let deltas: Vec<f64> = (0..n_samples)
            .map(|_| weights[i] * sigma * standard_normal(&mut rng))
            .collect();
        indices.push(sample_std(&deltas).powi(2));
    }

    let total: f64 = indices.iter().sum();
    if total > 0.0 {
        for v in &mut indices {
            *v /= total;
        }
    }
    Ok(indices)
}
