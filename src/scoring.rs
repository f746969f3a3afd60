// ⚖️ Weighted Scoring Engine
//
//   overall = round(Σ weight_f × score_f, 1 decimal)
//
// Factors excluded under their missing policy hand their weight to the rest
// in proportion. Anything else missing is a validation error, never a default.

use std::collections::BTreeMap;

use crate::entities::{AlgorithmVersion, MissingPolicy};
use crate::error::{EngineError, EngineResult};
use crate::normalizer::NormalizedFactors;

/// Round half away from zero to one decimal
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to cents. Current scores are kept at this precision so equal
/// totals compare equal however their deltas were summed.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct WeightedScoringEngine {
    weight_tolerance: f64,
}

impl WeightedScoringEngine {
    pub fn new(weight_tolerance: f64) -> Self {
        WeightedScoringEngine { weight_tolerance }
    }

    pub fn score(
        &self,
        factor_scores: &BTreeMap<String, f64>,
        version: &AlgorithmVersion,
    ) -> EngineResult<f64> {
        version.check_weights(self.weight_tolerance)?;

        let mut weighted_sum = 0.0;
        let mut present_weight = 0.0;
        let mut excluded_any = false;

        for (factor, weight) in &version.weights {
            match factor_scores.get(factor) {
                Some(score) => {
                    if !score.is_finite() || !(0.0..=100.0).contains(score) {
                        return Err(EngineError::validation(format!(
                            "factor {} score {} is outside [0, 100]",
                            factor, score
                        )));
                    }
                    weighted_sum += weight * score;
                    present_weight += weight;
                }
                None => {
                    let policy = version.factors.get(factor).and_then(|def| def.missing);
                    if policy != Some(MissingPolicy::Exclude) {
                        return Err(EngineError::validation(format!(
                            "algorithm {}: required factor {} is absent and has no exclusion policy",
                            version.version, factor
                        )));
                    }
                    excluded_any = true;
                }
            }
        }

        if present_weight <= 0.0 {
            return Err(EngineError::validation(format!(
                "algorithm {}: every weighted factor is absent",
                version.version
            )));
        }

        let overall = if excluded_any {
            weighted_sum / present_weight
        } else {
            weighted_sum
        };

        Ok(round1(overall))
    }

    /// Score normalizer output, naming the entity when a required metric is missing
    pub fn score_normalized(
        &self,
        normalized: &NormalizedFactors,
        version: &AlgorithmVersion,
    ) -> EngineResult<f64> {
        if !normalized.missing_required.is_empty() {
            return Err(EngineError::validation(format!(
                "entity {}: required factor(s) {} missing with no exclusion policy",
                normalized.entity_id,
                normalized.missing_required.join(", ")
            )));
        }
        self.score(&normalized.scores, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::algorithm::tests::sample_version;

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_weighted_average() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");

        // 0.5*80 + 0.3*60 + 0.2*50 = 40 + 18 + 10
        let overall = engine
            .score(
                &scores(&[("adoption", 80.0), ("benchmark", 60.0), ("velocity", 50.0)]),
                &version,
            )
            .unwrap();
        assert_eq!(overall, 68.0);
    }

    #[test]
    fn test_rounds_to_one_decimal() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");

        // 0.5*33.333 + 0.3*50 + 0.2*12.34 = 16.6665 + 15 + 2.468 = 34.1345
        let overall = engine
            .score(
                &scores(&[("adoption", 33.333), ("benchmark", 50.0), ("velocity", 12.34)]),
                &version,
            )
            .unwrap();
        assert_eq!(overall, 34.1);
    }

    #[test]
    fn test_excluded_weight_redistributed() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");

        // adoption excluded: (0.3*60 + 0.2*50) / 0.5 = 28 / 0.5
        let overall = engine
            .score(&scores(&[("benchmark", 60.0), ("velocity", 50.0)]), &version)
            .unwrap();
        assert_eq!(overall, 56.0);
    }

    #[test]
    fn test_required_factor_absent_fails() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");

        let err = engine
            .score(&scores(&[("adoption", 60.0), ("velocity", 50.0)]), &version)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // velocity scores 0 when missing, so the normalizer always supplies it;
        // a caller that omits it anyway is rejected too
        assert!(engine
            .score(&scores(&[("adoption", 60.0), ("benchmark", 50.0)]), &version)
            .is_err());
    }

    #[test]
    fn test_bad_weights_fail() {
        let engine = WeightedScoringEngine::new(1e-6);
        let mut version = sample_version("7.2");
        version.weights.insert("adoption".to_string(), 0.6);

        let err = engine
            .score(
                &scores(&[("adoption", 80.0), ("benchmark", 60.0), ("velocity", 50.0)]),
                &version,
            )
            .unwrap_err();
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn test_out_of_range_factor_fails() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");

        assert!(engine
            .score(
                &scores(&[("adoption", 180.0), ("benchmark", 60.0), ("velocity", 50.0)]),
                &version,
            )
            .is_err());
    }

    #[test]
    fn test_reproducible() {
        let engine = WeightedScoringEngine::new(1e-6);
        let version = sample_version("7.2");
        let input = scores(&[("adoption", 71.25), ("benchmark", 48.5), ("velocity", 90.0)]);

        let first = engine.score(&input, &version).unwrap();
        for _ in 0..10 {
            assert_eq!(engine.score(&input, &version).unwrap(), first);
        }
    }
}
