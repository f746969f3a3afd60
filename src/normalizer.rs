// 📏 Metrics Normalizer - Raw provider metrics → factor scores in [0, 100]
//
// Pipeline per factor:
//   1. Read the factor's metric (flags count as 1/0)
//   2. Log-scale skewed metrics: ln(1 + x)
//   3. Calibrate min/max on the epoch population, clipping the top at a percentile
//      (or use the factor's fixed range)
//   4. Min-max to [0, 100]
//
// Pure: the same metrics + calibration always give the same scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::entities::{AlgorithmVersion, FactorDefinition, MissingPolicy, Scale};
use crate::metrics::{EpochMetrics, MetricMap};

const DEGENERATE_RANGE: f64 = 1e-12;

// ============================================================================
// OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub entity_id: String,
    pub factor: String,
    pub value: f64,
    pub computed_at: DateTime<Utc>,
}

/// Non-fatal: the factor was scored (or dropped) per its missing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingMetricWarning {
    pub entity_id: String,
    pub factor: String,
    pub metric: String,
    pub policy: Option<MissingPolicy>,
}

impl fmt::Display for MissingMetricWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.policy {
            Some(MissingPolicy::Exclude) => "excluded from weighting",
            Some(MissingPolicy::Zero) => "scored as 0",
            None => "required, no policy",
        };
        write!(
            f,
            "{}: metric {} missing for factor {} ({})",
            self.entity_id, self.metric, self.factor, action
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedFactors {
    pub entity_id: String,

    /// factor → score in [0, 100]
    pub scores: BTreeMap<String, f64>,

    /// Factors dropped under the exclude policy
    pub excluded: Vec<String>,

    /// Factors with no value and no policy; scoring will refuse these
    pub missing_required: Vec<String>,

    pub warnings: Vec<MissingMetricWarning>,
}

impl NormalizedFactors {
    pub fn to_factor_scores(&self, computed_at: DateTime<Utc>) -> Vec<FactorScore> {
        self.scores
            .iter()
            .map(|(factor, value)| FactorScore {
                entity_id: self.entity_id.clone(),
                factor: factor.clone(),
                value: *value,
                computed_at,
            })
            .collect()
    }
}

// ============================================================================
// CALIBRATION
// ============================================================================

/// Bounds in transformed (post-log) units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub min: f64,
    pub max: f64,
}

impl Calibration {
    /// Fit bounds to the present values of one factor
    pub fn fit(def: &FactorDefinition, population: &[f64]) -> Self {
        if let Some([min, max]) = def.range {
            return Calibration {
                min: transform(def.scale, min),
                max: transform(def.scale, max),
            };
        }

        let mut values: Vec<f64> = population.iter().map(|v| transform(def.scale, *v)).collect();
        if values.is_empty() {
            return Calibration { min: 0.0, max: 0.0 };
        }
        values.sort_by(f64::total_cmp);

        let min = values[0];
        let max = match def.clip_percentile {
            Some(p) => nearest_rank(&values, p),
            None => values[values.len() - 1],
        };

        Calibration { min, max }
    }

    /// Map a transformed value into [0, 100]
    pub fn scale(&self, transformed: f64, raw: f64) -> f64 {
        if self.max - self.min <= DEGENERATE_RANGE {
            return if raw > 0.0 { 100.0 } else { 0.0 };
        }
        let clamped = transformed.clamp(self.min, self.max);
        (clamped - self.min) / (self.max - self.min) * 100.0
    }
}

fn transform(scale: Scale, value: f64) -> f64 {
    match scale {
        Scale::Linear => value,
        Scale::Log => value.max(0.0).ln_1p(),
    }
}

/// Nearest-rank percentile of an ascending slice
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct MetricsNormalizer {
    factors: BTreeMap<String, FactorDefinition>,
    calibrations: BTreeMap<String, Calibration>,
}

impl MetricsNormalizer {
    /// Calibrate every factor of `version` on an epoch population
    pub fn calibrate(version: &AlgorithmVersion, population: &EpochMetrics) -> Self {
        let calibrations = version
            .factors
            .iter()
            .map(|(name, def)| {
                let present: Vec<f64> = population
                    .values()
                    .filter_map(|metrics| metric_value(metrics, &def.metric))
                    .collect();
                (name.clone(), Calibration::fit(def, &present))
            })
            .collect();

        MetricsNormalizer {
            factors: version.factors.clone(),
            calibrations,
        }
    }

    /// Use known calibration parameters (e.g. to reproduce an audit)
    pub fn with_calibrations(
        version: &AlgorithmVersion,
        calibrations: BTreeMap<String, Calibration>,
    ) -> Self {
        MetricsNormalizer {
            factors: version.factors.clone(),
            calibrations,
        }
    }

    pub fn calibrations(&self) -> &BTreeMap<String, Calibration> {
        &self.calibrations
    }

    pub fn normalize(&self, entity_id: &str, metrics: &MetricMap) -> NormalizedFactors {
        let mut out = NormalizedFactors {
            entity_id: entity_id.to_string(),
            ..NormalizedFactors::default()
        };

        for (name, def) in &self.factors {
            match metric_value(metrics, &def.metric) {
                Some(raw) => {
                    let calibration = self
                        .calibrations
                        .get(name)
                        .copied()
                        .unwrap_or_else(|| Calibration::fit(def, &[raw]));
                    let score = calibration.scale(transform(def.scale, raw), raw);
                    out.scores.insert(name.clone(), score);
                }
                None => {
                    match def.missing {
                        Some(MissingPolicy::Exclude) => out.excluded.push(name.clone()),
                        Some(MissingPolicy::Zero) => {
                            out.scores.insert(name.clone(), 0.0);
                        }
                        None => out.missing_required.push(name.clone()),
                    }
                    out.warnings.push(MissingMetricWarning {
                        entity_id: entity_id.to_string(),
                        factor: name.clone(),
                        metric: def.metric.clone(),
                        policy: def.missing,
                    });
                }
            }
        }

        out
    }
}

fn metric_value(metrics: &MetricMap, metric: &str) -> Option<f64> {
    metrics
        .get(metric)
        .copied()
        .flatten()
        .map(|v| v.as_f64())
        .filter(|v| v.is_finite())
}
