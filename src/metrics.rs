// 📥 Metric Epochs - Frozen provider snapshots
// Providers hand over {entityId → {metricName → value|null}}; an epoch is
// stored once and never edited, so baselines can always be recomputed.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::db::{is_constraint_violation, json_column};
use crate::error::{EngineError, EngineResult};

/// Opaque provider value: a number or a yes/no flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Number(f64),
}

impl MetricValue {
    /// Flags count as 1/0
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Flag(true) => 1.0,
            MetricValue::Flag(false) => 0.0,
            MetricValue::Number(n) => *n,
        }
    }
}

/// metric name → value (None = provider reported null)
pub type MetricMap = BTreeMap<String, Option<MetricValue>>;

/// entity id → metrics, for one epoch
pub type EpochMetrics = BTreeMap<String, MetricMap>;

// ============================================================================
// METRIC STORE
// ============================================================================

pub struct MetricStore<'c> {
    conn: &'c Connection,
}

impl<'c> MetricStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        MetricStore { conn }
    }

    /// Freeze an epoch. Run inside a transaction so a half-written epoch never exists.
    pub fn record_epoch(&self, epoch: &str, metrics: &EpochMetrics) -> EngineResult<usize> {
        if epoch.trim().is_empty() {
            return Err(EngineError::validation("metrics epoch must not be empty"));
        }
        for (entity_id, values) in metrics {
            for (name, value) in values {
                if let Some(MetricValue::Number(n)) = value {
                    if !n.is_finite() {
                        return Err(EngineError::validation(format!(
                            "metric {} for {} is not a finite number",
                            name, entity_id
                        )));
                    }
                }
            }
        }

        let result = self.conn.execute(
            "INSERT INTO metric_epochs (epoch, recorded_at) VALUES (?1, ?2)",
            params![epoch, Utc::now().to_rfc3339()],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(EngineError::validation(format!(
                    "metrics epoch {} is already frozen",
                    epoch
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let mut stmt = self.conn.prepare(
            "INSERT INTO metric_values (epoch, entity_id, metrics) VALUES (?1, ?2, ?3)",
        )?;
        for (entity_id, values) in metrics {
            stmt.execute(params![epoch, entity_id, serde_json::to_string(values)?])?;
        }

        Ok(metrics.len())
    }

    pub fn load_epoch(&self, epoch: &str) -> EngineResult<EpochMetrics> {
        if !self.has_epoch(epoch)? {
            return Err(EngineError::not_found("metrics epoch", epoch));
        }

        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, metrics FROM metric_values WHERE epoch = ?1")?;
        let rows = stmt
            .query_map(params![epoch], |row| {
                Ok((row.get::<_, String>(0)?, json_column::<MetricMap>(row, 1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(rows)
    }

    pub fn has_epoch(&self, epoch: &str) -> EngineResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM metric_epochs WHERE epoch = ?1",
                params![epoch],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recently recorded epoch
    pub fn latest_epoch(&self) -> EngineResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT epoch FROM metric_epochs ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }
}

// ============================================================================
// FILE LOADERS (CLI input)
// ============================================================================

/// Load `{entityId: {metric: value|null}}` from JSON
pub fn load_metrics_json(path: &Path) -> Result<EpochMetrics> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metrics file: {:?}", path))?;
    serde_json::from_str(&content).context("Failed to parse metrics JSON")
}

/// Load a wide CSV: first column entity id, one column per metric, empty = null
pub fn load_metrics_csv(path: &Path) -> Result<EpochMetrics> {
    let mut rdr = csv::Reader::from_path(path).context("Failed to open metrics CSV")?;
    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    if headers.len() < 2 {
        bail!("metrics CSV needs an entity id column and at least one metric column");
    }

    let mut metrics = EpochMetrics::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read CSV row {}", line + 2))?;

        let entity_id = record.get(0).unwrap_or_default().trim().to_string();
        if entity_id.is_empty() {
            bail!("CSV row {} has no entity id", line + 2);
        }

        let mut values = MetricMap::new();
        for (name, cell) in headers.iter().zip(record.iter()).skip(1) {
            values.insert(name.trim().to_string(), parse_cell(cell).with_context(|| {
                format!("CSV row {}, column {}", line + 2, name)
            })?);
        }
        metrics.insert(entity_id, values);
    }

    Ok(metrics)
}

fn parse_cell(cell: &str) -> Result<Option<MetricValue>> {
    let cell = cell.trim();
    match cell.to_ascii_lowercase().as_str() {
        "" | "null" => Ok(None),
        "true" => Ok(Some(MetricValue::Flag(true))),
        "false" => Ok(Some(MetricValue::Flag(false))),
        _ => {
            let n: f64 = cell
                .parse()
                .with_context(|| format!("'{}' is not a number or boolean", cell))?;
            Ok(Some(MetricValue::Number(n)))
        }
    }
}
