// 🔭 Current Score Projector
//
//   current(e) = baseline(e, latest epoch) + Σ deltas(e) since that baseline
//
// The projection is cached in `current_scores` and rewritten in the same
// transaction as every ledger write. `verify_invariant` recomputes it from the
// ledgers and reports every entity where cache and ledgers disagree.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::db::timestamp_column;
use crate::entities::EntityRoster;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{BaselineLedger, DeltaLedger};
use crate::scoring::round2;

// ============================================================================
// PROJECTED SCORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedScore {
    pub entity_id: String,
    pub baseline_id: i64,
    pub baseline_score: f64,
    pub delta_total: f64,
    pub current_score: f64,
    pub updated_at: DateTime<Utc>,
}

impl ProjectedScore {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ProjectedScore {
            entity_id: row.get(0)?,
            baseline_id: row.get(1)?,
            baseline_score: row.get(2)?,
            delta_total: row.get(3)?,
            current_score: row.get(4)?,
            updated_at: timestamp_column(row, 5)?,
        })
    }
}

// ============================================================================
// INVARIANT VIOLATIONS
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantViolation {
    #[error("{entity_id}: cached score {cached} != baseline + deltas {expected}")]
    ScoreDrift {
        entity_id: String,
        cached: f64,
        expected: f64,
    },

    #[error("subject {subject} is claimed by several entities: {}", .entity_ids.join(", "))]
    DuplicateSubjectClaim {
        subject: String,
        entity_ids: Vec<String>,
    },

    #[error("{entity_id}: active entity has no baseline")]
    MissingBaseline { entity_id: String },

    #[error("{entity_id}: baseline exists but no projected score")]
    MissingProjection { entity_id: String },

    #[error("snapshot {snapshot_id}: {detail}")]
    RankCollision { snapshot_id: String, detail: String },

    #[error("snapshot {snapshot_id}: entry {entity_id} is not an active entity")]
    InactiveEntry {
        snapshot_id: String,
        entity_id: String,
    },

    #[error("snapshot {snapshot_id}: active entity {entity_id} has no entry")]
    MissingEntry {
        snapshot_id: String,
        entity_id: String,
    },
}

// ============================================================================
// PROJECTOR
// ============================================================================

const PROJECTION_COLUMNS: &str =
    "entity_id, baseline_id, baseline_score, delta_total, current_score, updated_at";

pub struct CurrentScoreProjector<'c> {
    conn: &'c Connection,
}

impl<'c> CurrentScoreProjector<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        CurrentScoreProjector { conn }
    }

    /// Recompute and cache an entity's projection. None if it has no baseline yet.
    pub fn refresh(&self, entity_id: &str) -> EngineResult<Option<ProjectedScore>> {
        let baseline = match BaselineLedger::new(self.conn).latest(entity_id)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let delta_total = DeltaLedger::new(self.conn).delta_since(entity_id, baseline.ledger_seq)?;

        let projected = ProjectedScore {
            entity_id: entity_id.to_string(),
            baseline_id: baseline.id,
            baseline_score: baseline.score,
            delta_total,
            current_score: round2(baseline.score + delta_total),
            updated_at: Utc::now(),
        };

        self.conn.execute(
            "INSERT INTO current_scores (
                entity_id, baseline_id, baseline_score, delta_total, current_score, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(entity_id) DO UPDATE SET
                baseline_id = excluded.baseline_id,
                baseline_score = excluded.baseline_score,
                delta_total = excluded.delta_total,
                current_score = excluded.current_score,
                updated_at = excluded.updated_at",
            params![
                projected.entity_id,
                projected.baseline_id,
                projected.baseline_score,
                projected.delta_total,
                projected.current_score,
                projected.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(projected))
    }

    pub fn get(&self, entity_id: &str) -> EngineResult<Option<ProjectedScore>> {
        let sql = format!(
            "SELECT {} FROM current_scores WHERE entity_id = ?1",
            PROJECTION_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![entity_id], ProjectedScore::from_row)
            .optional()?)
    }

    pub fn current_score(&self, entity_id: &str) -> EngineResult<ProjectedScore> {
        self.get(entity_id)?
            .ok_or_else(|| EngineError::not_found("current score", entity_id))
    }

    /// Cached projections of active entities, keyed by entity id
    pub fn active_scores(&self) -> EngineResult<BTreeMap<String, ProjectedScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.entity_id, c.baseline_id, c.baseline_score, c.delta_total,
                    c.current_score, c.updated_at
             FROM current_scores c
             JOIN entities e ON e.id = c.entity_id
             WHERE e.status = 'active'
             ORDER BY c.entity_id",
        )?;
        let scores = stmt
            .query_map([], ProjectedScore::from_row)?
            .map(|r| r.map(|p| (p.entity_id.clone(), p)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(scores)
    }

    /// Scan every active entity; empty means consistent
    pub fn verify_invariant(&self, tolerance: f64) -> EngineResult<Vec<InvariantViolation>> {
        let roster = EntityRoster::new(self.conn);
        let baselines = BaselineLedger::new(self.conn);
        let deltas = DeltaLedger::new(self.conn);

        let mut violations: Vec<InvariantViolation> = roster
            .duplicate_subject_claims()?
            .into_iter()
            .map(|(subject, entity_ids)| InvariantViolation::DuplicateSubjectClaim {
                subject,
                entity_ids,
            })
            .collect();

        for entity in roster.active()? {
            let baseline = match baselines.latest(&entity.id)? {
                Some(b) => b,
                None => {
                    violations.push(InvariantViolation::MissingBaseline {
                        entity_id: entity.id.clone(),
                    });
                    continue;
                }
            };

            let expected = baseline.score + deltas.delta_since(&entity.id, baseline.ledger_seq)?;
            match self.get(&entity.id)? {
                None => violations.push(InvariantViolation::MissingProjection {
                    entity_id: entity.id.clone(),
                }),
                Some(cached) => {
                    let drifted = (cached.current_score - expected).abs() >= tolerance;
                    if drifted || cached.baseline_id != baseline.id {
                        violations.push(InvariantViolation::ScoreDrift {
                            entity_id: entity.id.clone(),
                            cached: cached.current_score,
                            expected,
                        });
                    }
                }
            }
        }

        Ok(violations)
    }
}
