// 🧮 Algorithm Versions - Weights, factor definitions and tier bands as data
//
// A version is write-once. Re-weighting means registering a new version,
// so any historical score can be reproduced from (metrics, version).

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::db::is_constraint_violation;
use crate::error::{EngineError, EngineResult};

// ============================================================================
// FACTOR DEFINITION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    Linear,

    /// ln(1 + x) before min-max; for stars, downloads, installs
    Log,
}

/// What to do when an entity has no value for the factor's metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    /// Drop the factor and spread its weight over the present ones
    Exclude,

    /// Score the factor as 0
    Zero,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDefinition {
    /// Provider metric this factor reads
    pub metric: String,

    #[serde(default)]
    pub scale: Scale,

    /// Upper outlier clip, as a percentile of the epoch population (e.g. 95)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_percentile: Option<f64>,

    /// Fixed [min, max] instead of population calibration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,

    /// None = the metric is required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<MissingPolicy>,
}

impl FactorDefinition {
    pub fn new(metric: &str) -> Self {
        FactorDefinition {
            metric: metric.to_string(),
            scale: Scale::Linear,
            clip_percentile: None,
            range: None,
            missing: None,
        }
    }

    pub fn log_scaled(mut self) -> Self {
        self.scale = Scale::Log;
        self
    }

    pub fn clipped_at(mut self, percentile: f64) -> Self {
        self.clip_percentile = Some(percentile);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some([min, max]);
        self
    }

    pub fn when_missing(mut self, policy: MissingPolicy) -> Self {
        self.missing = Some(policy);
        self
    }
}

// ============================================================================
// TIER BANDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBand {
    pub tier: String,
    pub min_rank: u32,

    /// None = open-ended (last band only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rank: Option<u32>,
}

impl TierBand {
    pub fn new(tier: &str, min_rank: u32, max_rank: Option<u32>) -> Self {
        TierBand {
            tier: tier.to_string(),
            min_rank,
            max_rank,
        }
    }

    pub fn contains(&self, rank: u32) -> bool {
        rank >= self.min_rank && self.max_rank.map_or(true, |max| rank <= max)
    }
}

/// S 1-5, A 6-15, B 16-30, C 31-45, D 46+
pub fn default_tier_bands() -> Vec<TierBand> {
    vec![
        TierBand::new("S", 1, Some(5)),
        TierBand::new("A", 6, Some(15)),
        TierBand::new("B", 16, Some(30)),
        TierBand::new("C", 31, Some(45)),
        TierBand::new("D", 46, None),
    ]
}

/// Bands must start at 1, be contiguous, and end open-ended
pub fn validate_tier_bands(bands: &[TierBand]) -> EngineResult<()> {
    let first = bands
        .first()
        .ok_or_else(|| EngineError::validation("tier bands must not be empty"))?;
    if first.min_rank != 1 {
        return Err(EngineError::validation(format!(
            "first tier band must start at rank 1, starts at {}",
            first.min_rank
        )));
    }

    for (i, band) in bands.iter().enumerate() {
        if band.tier.trim().is_empty() {
            return Err(EngineError::validation("tier name must not be empty"));
        }
        let is_last = i + 1 == bands.len();
        match (band.max_rank, is_last) {
            (None, true) => {}
            (None, false) => {
                return Err(EngineError::validation(format!(
                    "only the last tier band may be open-ended ({} is not last)",
                    band.tier
                )))
            }
            (Some(_), true) => {
                return Err(EngineError::validation(format!(
                    "last tier band {} must be open-ended",
                    band.tier
                )))
            }
            (Some(max), false) => {
                if max < band.min_rank {
                    return Err(EngineError::validation(format!(
                        "tier band {} has max {} below min {}",
                        band.tier, max, band.min_rank
                    )));
                }
                let next = &bands[i + 1];
                if next.min_rank != max + 1 {
                    return Err(EngineError::validation(format!(
                        "tier bands {} and {} are not contiguous",
                        band.tier, next.tier
                    )));
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// ALGORITHM VERSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmVersion {
    /// e.g. "7.2"
    pub version: String,

    /// factor name → weight, Σ = 1.0
    pub weights: BTreeMap<String, f64>,

    /// factor name → how to derive it from metrics
    pub factors: BTreeMap<String, FactorDefinition>,

    #[serde(default = "default_tier_bands")]
    pub tier_bands: Vec<TierBand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AlgorithmVersion {
    /// Load a version definition from JSON (validated on registration, not here)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read algorithm file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse algorithm JSON")
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn check_weights(&self, tolerance: f64) -> EngineResult<()> {
        if self.weights.is_empty() {
            return Err(EngineError::validation(format!(
                "algorithm {} has no weights",
                self.version
            )));
        }
        for (factor, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(EngineError::validation(format!(
                    "algorithm {}: weight for {} must be a non-negative number, got {}",
                    self.version, factor, weight
                )));
            }
        }
        let sum = self.weight_sum();
        if (sum - 1.0).abs() > tolerance {
            return Err(EngineError::validation(format!(
                "algorithm {}: weights sum to {}, expected 1.0",
                self.version, sum
            )));
        }
        Ok(())
    }

    /// Full structural validation, run before a version is stored
    pub fn validate(&self, weight_tolerance: f64) -> EngineResult<()> {
        if self.version.trim().is_empty() {
            return Err(EngineError::validation("algorithm version id must not be empty"));
        }

        self.check_weights(weight_tolerance)?;

        for factor in self.weights.keys() {
            if !self.factors.contains_key(factor) {
                return Err(EngineError::validation(format!(
                    "algorithm {}: weighted factor {} has no definition",
                    self.version, factor
                )));
            }
        }

        for (name, def) in &self.factors {
            if !self.weights.contains_key(name) {
                return Err(EngineError::validation(format!(
                    "algorithm {}: factor {} has no weight",
                    self.version, name
                )));
            }
            if def.metric.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "algorithm {}: factor {} has no metric",
                    self.version, name
                )));
            }
            if let Some(p) = def.clip_percentile {
                if !(p > 0.0 && p <= 100.0) {
                    return Err(EngineError::validation(format!(
                        "algorithm {}: factor {} clip percentile {} outside (0, 100]",
                        self.version, name, p
                    )));
                }
            }
            if let Some([min, max]) = def.range {
                if !(min.is_finite() && max.is_finite() && min < max) {
                    return Err(EngineError::validation(format!(
                        "algorithm {}: factor {} range [{}, {}] is invalid",
                        self.version, name, min, max
                    )));
                }
            }
        }

        validate_tier_bands(&self.tier_bands)
    }

    /// Tier for a rank. Bands are validated to cover every rank ≥ 1.
    pub fn tier_for(&self, rank: u32) -> Option<&str> {
        self.tier_bands
            .iter()
            .find(|band| band.contains(rank))
            .map(|band| band.tier.as_str())
    }
}

// ============================================================================
// ALGORITHM REGISTRY
// ============================================================================

pub struct AlgorithmRegistry<'c> {
    conn: &'c Connection,
}

impl<'c> AlgorithmRegistry<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        AlgorithmRegistry { conn }
    }

    /// Store a new version. Existing versions are never replaced.
    pub fn register(&self, version: &AlgorithmVersion, weight_tolerance: f64) -> EngineResult<()> {
        version.validate(weight_tolerance)?;

        let definition = serde_json::to_string(version)?;
        let result = self.conn.execute(
            "INSERT INTO algorithm_versions (version, definition, created_at) VALUES (?1, ?2, ?3)",
            params![version.version, definition, Utc::now().to_rfc3339()],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(EngineError::validation(format!(
                "algorithm version {} already exists; register a new version instead",
                version.version
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, version: &str) -> EngineResult<Option<AlgorithmVersion>> {
        let definition: Option<String> = self
            .conn
            .query_row(
                "SELECT definition FROM algorithm_versions WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;

        match definition {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, version: &str) -> EngineResult<AlgorithmVersion> {
        self.get(version)?
            .ok_or_else(|| EngineError::not_found("algorithm version", version))
    }

    /// Version ids in registration order
    pub fn list(&self) -> EngineResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM algorithm_versions ORDER BY created_at, version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(versions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::setup_database;

    /// Three-factor version used across the crate's tests
    pub(crate) fn sample_version(id: &str) -> AlgorithmVersion {
        let mut weights = BTreeMap::new();
        weights.insert("adoption".to_string(), 0.5);
        weights.insert("benchmark".to_string(), 0.3);
        weights.insert("velocity".to_string(), 0.2);

        let mut factors = BTreeMap::new();
        factors.insert(
            "adoption".to_string(),
            FactorDefinition::new("github_stars")
                .log_scaled()
                .when_missing(MissingPolicy::Exclude),
        );
        factors.insert(
            "benchmark".to_string(),
            FactorDefinition::new("swe_bench").with_range(0.0, 100.0),
        );
        factors.insert(
            "velocity".to_string(),
            FactorDefinition::new("commits_30d").when_missing(MissingPolicy::Zero),
        );

        AlgorithmVersion {
            version: id.to_string(),
            weights,
            factors,
            tier_bands: default_tier_bands(),
            description: None,
        }
    }

    #[test]
    fn test_sample_version_is_valid() {
        let version = sample_version("7.2");
        assert!(version.validate(1e-6).is_ok());
        assert!((version.weight_sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut version = sample_version("bad");
        version.weights.insert("velocity".to_string(), 0.25);

        let err = version.validate(1e-6).unwrap_err();
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn test_default_bands() {
        let version = sample_version("7.2");
        assert_eq!(version.tier_for(1), Some("S"));
        assert_eq!(version.tier_for(5), Some("S"));
        assert_eq!(version.tier_for(6), Some("A"));
        assert_eq!(version.tier_for(20), Some("B"));
        assert_eq!(version.tier_for(45), Some("C"));
        assert_eq!(version.tier_for(46), Some("D"));
        assert_eq!(version.tier_for(500), Some("D"));
    }

    #[test]
    fn test_band_validation() {
        assert!(validate_tier_bands(&default_tier_bands()).is_ok());

        let gap = vec![TierBand::new("S", 1, Some(5)), TierBand::new("A", 7, None)];
        assert!(validate_tier_bands(&gap).is_err());

        let overlap = vec![TierBand::new("S", 1, Some(5)), TierBand::new("A", 5, None)];
        assert!(validate_tier_bands(&overlap).is_err());

        let closed = vec![TierBand::new("S", 1, Some(5))];
        assert!(validate_tier_bands(&closed).is_err());

        let late_start = vec![TierBand::new("S", 2, None)];
        assert!(validate_tier_bands(&late_start).is_err());
    }

    #[test]
    fn test_registry_is_write_once() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let registry = AlgorithmRegistry::new(&conn);

        registry.register(&sample_version("7.2"), 1e-6).unwrap();
        let loaded = registry.require("7.2").unwrap();
        assert_eq!(loaded, sample_version("7.2"));

        let mut edited = sample_version("7.2");
        edited.weights.insert("adoption".to_string(), 0.4);
        edited.weights.insert("velocity".to_string(), 0.3);
        assert!(registry.register(&edited, 1e-6).is_err());

        // Storage refuses direct edits too
        assert!(conn
            .execute("UPDATE algorithm_versions SET definition = '{}'", [])
            .is_err());

        assert_eq!(registry.list().unwrap(), vec!["7.2".to_string()]);
    }

    #[test]
    fn test_version_json_defaults_bands() {
        let json = r#"{
            "version": "7.6",
            "weights": {"adoption": 1.0},
            "factors": {"adoption": {"metric": "github_stars", "scale": "log", "missing": "exclude"}}
        }"#;
        let version: AlgorithmVersion = serde_json::from_str(json).unwrap();
        assert_eq!(version.tier_bands, default_tier_bands());
        assert_eq!(version.factors["adoption"].scale, Scale::Log);
        assert!(version.validate(1e-6).is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(&mut file, &sample_version("8.0")).unwrap();

        let loaded = AlgorithmVersion::from_file(file.path()).unwrap();
        assert_eq!(loaded, sample_version("8.0"));

        assert!(AlgorithmVersion::from_file("/nonexistent/algorithm.json").is_err());
    }
}
