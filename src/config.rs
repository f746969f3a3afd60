// ⚙️ Engine Configuration
// Tolerances and thresholds as data, loaded from JSON with defaults for every field

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file used by the CLI
    pub database_path: String,

    /// Max allowed |cached current − (baseline + Σdeltas)|
    pub invariant_tolerance: f64,

    /// Max allowed |Σweights − 1.0| for an algorithm version
    pub weight_tolerance: f64,

    /// Cap on |scoreChange| for manual_adjustment events
    pub max_manual_adjustment: f64,

    /// |rank change| at or above this is a major rise/decline
    pub major_move_threshold: i64,

    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,

    /// Default tracing filter (RUST_LOG wins when set)
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: "leaderboard.db".to_string(),
            invariant_tolerance: 0.01,
            weight_tolerance: 1e-6,
            max_manual_adjustment: 5.0,
            major_move_threshold: 5,
            busy_timeout_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load config from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.invariant_tolerance > 0.0) {
            bail!("invariant_tolerance must be positive, got {}", self.invariant_tolerance);
        }
        if !(self.weight_tolerance > 0.0) {
            bail!("weight_tolerance must be positive, got {}", self.weight_tolerance);
        }
        if !(self.max_manual_adjustment >= 0.0) {
            bail!(
                "max_manual_adjustment must be non-negative, got {}",
                self.max_manual_adjustment
            );
        }
        if self.major_move_threshold < 1 {
            bail!(
                "major_move_threshold must be at least 1, got {}",
                self.major_move_threshold
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.invariant_tolerance, 0.01);
        assert_eq!(config.major_move_threshold, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_manual_adjustment": 2.5, "database_path": "x.db" }}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_manual_adjustment, 2.5);
        assert_eq!(config.database_path, "x.db");
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let config = EngineConfig {
            major_move_threshold: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
