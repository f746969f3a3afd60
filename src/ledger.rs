// 📒 Baseline & Delta Ledgers
//
// Baseline: an entity's score frozen at an epoch. Write-once per (entity, epoch).
// Delta:    signed adjustments attributed to source events. Append-only.
//
// "Since baseline" is positional: a baseline remembers the ledger sequence it
// was established at, and only later deltas count toward the current score.
// Replays are caught by a UNIQUE idempotency key, not by in-process locks.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::db::{is_constraint_violation, json_column, timestamp_column};
use crate::error::{EngineError, EngineResult};

// ============================================================================
// BASELINE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub id: i64,
    pub entity_id: String,
    pub epoch: String,
    pub score: f64,
    pub algorithm_version: String,

    /// Factor scores the overall score was computed from (audit trail)
    pub factor_scores: BTreeMap<String, f64>,

    /// Highest delta ledger seq at establishment
    pub ledger_seq: i64,

    pub established_at: DateTime<Utc>,
}

impl BaselineRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(BaselineRecord {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            epoch: row.get(2)?,
            score: row.get(3)?,
            algorithm_version: row.get(4)?,
            factor_scores: json_column(row, 5)?,
            ledger_seq: row.get(6)?,
            established_at: timestamp_column(row, 7)?,
        })
    }
}

const BASELINE_COLUMNS: &str = "b.id, b.entity_id, b.epoch, b.score, b.algorithm_version, \
     b.factor_scores, b.ledger_seq, b.established_at";

// Epoch order is the order metric epochs were frozen in, not establishment order
const BASELINES_BY_EPOCH: &str =
    "baselines b LEFT JOIN metric_epochs m ON m.epoch = b.epoch WHERE b.entity_id = ?1";

pub struct BaselineLedger<'c> {
    conn: &'c Connection,
}

impl<'c> BaselineLedger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        BaselineLedger { conn }
    }

    /// Freeze a baseline. Fails if one already exists for (entity, epoch).
    pub fn insert(
        &self,
        entity_id: &str,
        epoch: &str,
        score: f64,
        algorithm_version: &str,
        factor_scores: &BTreeMap<String, f64>,
    ) -> EngineResult<BaselineRecord> {
        if self.get(entity_id, epoch)?.is_some() {
            return Err(EngineError::BaselineExists {
                entity_id: entity_id.to_string(),
                epoch: epoch.to_string(),
            });
        }

        let ledger_seq = DeltaLedger::new(self.conn).head_seq()?;
        let result = self.conn.execute(
            "INSERT INTO baselines (
                entity_id, epoch, score, algorithm_version, factor_scores,
                ledger_seq, established_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity_id,
                epoch,
                score,
                algorithm_version,
                serde_json::to_string(factor_scores)?,
                ledger_seq,
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(EngineError::BaselineExists {
                    entity_id: entity_id.to_string(),
                    epoch: epoch.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        self.get(entity_id, epoch)?
            .ok_or_else(|| EngineError::not_found("baseline", format!("{}@{}", entity_id, epoch)))
    }

    pub fn get(&self, entity_id: &str, epoch: &str) -> EngineResult<Option<BaselineRecord>> {
        let sql = format!(
            "SELECT {} FROM baselines b WHERE b.entity_id = ?1 AND b.epoch = ?2",
            BASELINE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![entity_id, epoch], BaselineRecord::from_row)
            .optional()?)
    }

    /// Baseline at the entity's latest epoch. Backfilling an older epoch
    /// never displaces it.
    pub fn latest(&self, entity_id: &str) -> EngineResult<Option<BaselineRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY COALESCE(m.seq, 0) DESC, b.id DESC LIMIT 1",
            BASELINE_COLUMNS, BASELINES_BY_EPOCH
        );
        Ok(self
            .conn
            .query_row(&sql, params![entity_id], BaselineRecord::from_row)
            .optional()?)
    }

    /// All baselines of an entity, oldest epoch first
    pub fn history(&self, entity_id: &str) -> EngineResult<Vec<BaselineRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY COALESCE(m.seq, 0), b.id",
            BASELINE_COLUMNS, BASELINES_BY_EPOCH
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![entity_id], BaselineRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

// ============================================================================
// SCORING EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Ordinary pipeline signal (article, release, benchmark result...)
    #[default]
    Signal,

    /// Reverses or amends an earlier event; needs a note
    Correction,

    /// Human-judged nudge; needs actor + note and is capped
    ManualAdjustment,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Signal => "signal",
            EventKind::Correction => "correction",
            EventKind::ManualAdjustment => "manual_adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signal" => Some(EventKind::Signal),
            "correction" => Some(EventKind::Correction),
            "manual_adjustment" => Some(EventKind::ManualAdjustment),
            _ => None,
        }
    }
}

/// What the event pipeline hands over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubmission {
    pub entity_id: String,
    pub source_event_id: String,
    pub score_change: f64,

    /// factor → share of the change
    #[serde(default)]
    pub factor_attributions: BTreeMap<String, f64>,

    #[serde(default)]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Event id this correction amends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrects: Option<String>,
}

impl EventSubmission {
    pub fn signal(entity_id: &str, source_event_id: &str, score_change: f64) -> Self {
        EventSubmission {
            entity_id: entity_id.to_string(),
            source_event_id: source_event_id.to_string(),
            score_change,
            factor_attributions: BTreeMap::new(),
            kind: EventKind::Signal,
            actor: None,
            note: None,
            corrects: None,
        }
    }

    /// Shape checks that need no storage
    pub fn validate(&self, max_manual_adjustment: f64) -> EngineResult<()> {
        if self.source_event_id.trim().is_empty() {
            return Err(EngineError::validation("source_event_id must not be empty"));
        }
        if !self.score_change.is_finite() {
            return Err(EngineError::validation(format!(
                "score_change for {} must be finite",
                self.source_event_id
            )));
        }
        if let Some((factor, _)) = self
            .factor_attributions
            .iter()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(EngineError::validation(format!(
                "attribution for factor {} must be finite",
                factor
            )));
        }

        let has = |field: &Option<String>| field.as_ref().map_or(false, |s| !s.trim().is_empty());

        match self.kind {
            EventKind::Signal => {}
            EventKind::Correction => {
                if !has(&self.note) {
                    return Err(EngineError::validation(format!(
                        "correction {} needs a note",
                        self.source_event_id
                    )));
                }
            }
            EventKind::ManualAdjustment => {
                if !has(&self.actor) || !has(&self.note) {
                    return Err(EngineError::validation(format!(
                        "manual adjustment {} needs an actor and a note",
                        self.source_event_id
                    )));
                }
                if self.score_change.abs() > max_manual_adjustment {
                    return Err(EngineError::validation(format!(
                        "manual adjustment {} of {} exceeds cap {}",
                        self.source_event_id, self.score_change, max_manual_adjustment
                    )));
                }
            }
        }

        Ok(())
    }
}

/// hash(sourceEventId, entityId)
pub fn idempotency_key(source_event_id: &str, entity_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", source_event_id, entity_id));
    format!("{:x}", hasher.finalize())
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringEvent {
    pub seq: i64,
    pub id: String,
    pub entity_id: String,
    pub source_event_id: String,
    pub score_change: f64,
    pub factor_attributions: BTreeMap<String, f64>,
    pub kind: EventKind,
    pub actor: Option<String>,
    pub note: Option<String>,
    pub corrects: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl ScoringEvent {
    /// Stamp a submission for the (already resolved) entity
    pub fn from_submission(submission: &EventSubmission, entity_id: &str) -> Self {
        ScoringEvent {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            source_event_id: submission.source_event_id.clone(),
            score_change: submission.score_change,
            factor_attributions: submission.factor_attributions.clone(),
            kind: submission.kind,
            actor: submission.actor.clone(),
            note: submission.note.clone(),
            corrects: submission.corrects.clone(),
            processed_at: Utc::now(),
            idempotency_key: idempotency_key(&submission.source_event_id, entity_id),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind_raw: String = row.get(7)?;
        let kind = EventKind::parse(&kind_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown event kind '{}'", kind_raw).into(),
            )
        })?;

        Ok(ScoringEvent {
            seq: row.get(0)?,
            id: row.get(1)?,
            entity_id: row.get(2)?,
            source_event_id: row.get(3)?,
            score_change: row.get(4)?,
            factor_attributions: json_column(row, 5)?,
            processed_at: timestamp_column(row, 6)?,
            kind,
            actor: row.get(8)?,
            note: row.get(9)?,
            corrects: row.get(10)?,
            idempotency_key: row.get(11)?,
        })
    }
}

const EVENT_COLUMNS: &str = "seq, event_id, entity_id, source_event_id, score_change, \
     factor_attributions, processed_at, kind, actor, note, corrects, idempotency_key";

// ============================================================================
// DELTA LEDGER
// ============================================================================

pub struct DeltaLedger<'c> {
    conn: &'c Connection,
}

impl<'c> DeltaLedger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        DeltaLedger { conn }
    }

    /// Append an event. Returns the stored row, or None when the key was seen before.
    pub fn append(&self, event: &ScoringEvent) -> EngineResult<Option<ScoringEvent>> {
        let result = self.conn.execute(
            "INSERT INTO scoring_events (
                event_id, entity_id, source_event_id, score_change, factor_attributions,
                processed_at, kind, actor, note, corrects, idempotency_key
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.entity_id,
                event.source_event_id,
                event.score_change,
                serde_json::to_string(&event.factor_attributions)?,
                event.processed_at.to_rfc3339(),
                event.kind.as_str(),
                event.actor,
                event.note,
                event.corrects,
                event.idempotency_key,
            ],
        );

        match result {
            Ok(_) => self.get(&event.id),
            Err(e) if is_constraint_violation(&e) => {
                if self.by_key(&event.idempotency_key)?.is_some() {
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, event_id: &str) -> EngineResult<Option<ScoringEvent>> {
        let sql = format!("SELECT {} FROM scoring_events WHERE event_id = ?1", EVENT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![event_id], ScoringEvent::from_row)
            .optional()?)
    }

    pub fn by_key(&self, key: &str) -> EngineResult<Option<ScoringEvent>> {
        let sql = format!(
            "SELECT {} FROM scoring_events WHERE idempotency_key = ?1",
            EVENT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![key], ScoringEvent::from_row)
            .optional()?)
    }

    /// Σ scoreChange for the entity's events after `since_seq`
    pub fn delta_since(&self, entity_id: &str, since_seq: i64) -> EngineResult<f64> {
        let total: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(score_change), 0.0) FROM scoring_events
             WHERE entity_id = ?1 AND seq > ?2",
            params![entity_id, since_seq],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Entity's events in application order
    pub fn events_for(&self, entity_id: &str) -> EngineResult<Vec<ScoringEvent>> {
        let sql = format!(
            "SELECT {} FROM scoring_events WHERE entity_id = ?1 ORDER BY seq",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![entity_id], ScoringEvent::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Highest seq so far (0 on an empty ledger)
    pub fn head_seq(&self) -> EngineResult<i64> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM scoring_events",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::algorithm::tests::sample_version;
    use crate::entities::{AlgorithmRegistry, Entity, EntityRoster};

    fn ledger_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        EntityRoster::new(&conn)
            .register(&Entity::new("x", "X", "x", "ide", "x"))
            .unwrap();
        AlgorithmRegistry::new(&conn)
            .register(&sample_version("7.2"), 1e-6)
            .unwrap();
        conn
    }

    fn factors() -> BTreeMap<String, f64> {
        let mut f = BTreeMap::new();
        f.insert("adoption".to_string(), 60.0);
        f
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let k1 = idempotency_key("article-42", "x");
        let k2 = idempotency_key("article-42", "x");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64, "SHA-256 hash should be 64 hex characters");
        assert_ne!(k1, idempotency_key("article-42", "y"));
        assert_ne!(k1, idempotency_key("article-43", "x"));
    }

    #[test]
    fn test_baseline_is_write_once() {
        let conn = ledger_db();
        let baselines = BaselineLedger::new(&conn);

        let record = baselines.insert("x", "2025-07", 60.0, "7.2", &factors()).unwrap();
        assert_eq!(record.score, 60.0);
        assert_eq!(record.ledger_seq, 0);
        assert_eq!(record.factor_scores, factors());

        let err = baselines.insert("x", "2025-07", 61.0, "7.2", &factors()).unwrap_err();
        assert!(matches!(err, EngineError::BaselineExists { .. }));

        assert!(conn.execute("UPDATE baselines SET score = 71", []).is_err());
        assert!(conn.execute("DELETE FROM baselines", []).is_err());
    }

    #[test]
    fn test_latest_follows_epoch_order_not_insert_order() {
        let conn = ledger_db();
        let store = crate::metrics::MetricStore::new(&conn);
        store.record_epoch("2025-07", &crate::metrics::EpochMetrics::new()).unwrap();
        store.record_epoch("2025-08", &crate::metrics::EpochMetrics::new()).unwrap();

        let baselines = BaselineLedger::new(&conn);
        baselines.insert("x", "2025-08", 80.0, "7.2", &factors()).unwrap();
        baselines.insert("x", "2025-07", 40.0, "7.2", &factors()).unwrap();

        let latest = baselines.latest("x").unwrap().unwrap();
        assert_eq!(latest.epoch, "2025-08");
        assert_eq!(latest.score, 80.0);

        let epochs: Vec<String> = baselines
            .history("x")
            .unwrap()
            .into_iter()
            .map(|b| b.epoch)
            .collect();
        assert_eq!(epochs, vec!["2025-07", "2025-08"]);

        println!("✅ Backfill test PASSED: older epoch does not displace newer baseline");
    }

    #[test]
    fn test_replay_is_absorbed() {
        let conn = ledger_db();
        let deltas = DeltaLedger::new(&conn);
        let submission = EventSubmission::signal("x", "article-1", 5.0);

        let first = deltas.append(&ScoringEvent::from_submission(&submission, "x")).unwrap();
        assert!(first.is_some());
        let replay = deltas.append(&ScoringEvent::from_submission(&submission, "x")).unwrap();
        assert!(replay.is_none());

        assert_eq!(deltas.delta_since("x", 0).unwrap(), 5.0);
        assert_eq!(deltas.events_for("x").unwrap().len(), 1);

        println!("✅ Replay test PASSED: duplicate event absorbed");
    }

    #[test]
    fn test_delta_counts_only_after_baseline() {
        let conn = ledger_db();
        let deltas = DeltaLedger::new(&conn);

        deltas
            .append(&ScoringEvent::from_submission(&EventSubmission::signal("x", "old", 9.0), "x"))
            .unwrap();
        let baseline = BaselineLedger::new(&conn)
            .insert("x", "2025-07", 60.0, "7.2", &factors())
            .unwrap();
        assert_eq!(baseline.ledger_seq, 1);

        for (source, change) in [("a1", 5.0), ("a2", 3.0), ("a3", 3.0)] {
            deltas
                .append(&ScoringEvent::from_submission(
                    &EventSubmission::signal("x", source, change),
                    "x",
                ))
                .unwrap();
        }

        assert_eq!(deltas.delta_since("x", baseline.ledger_seq).unwrap(), 11.0);
        assert_eq!(deltas.head_seq().unwrap(), 4);
    }

    #[test]
    fn test_ledger_is_append_only() {
        let conn = ledger_db();
        let deltas = DeltaLedger::new(&conn);
        deltas
            .append(&ScoringEvent::from_submission(&EventSubmission::signal("x", "a", 1.0), "x"))
            .unwrap();

        assert!(conn.execute("UPDATE scoring_events SET score_change = 50", []).is_err());
        assert!(conn.execute("DELETE FROM scoring_events", []).is_err());
    }

    #[test]
    fn test_submission_rules() {
        assert!(EventSubmission::signal("x", "a", f64::NAN).validate(5.0).is_err());
        assert!(EventSubmission::signal("x", " ", 1.0).validate(5.0).is_err());

        let mut manual = EventSubmission::signal("x", "override-1", 4.0);
        manual.kind = EventKind::ManualAdjustment;
        assert!(manual.validate(5.0).is_err(), "needs actor + note");

        manual.actor = Some("editor@site".to_string());
        manual.note = Some("Benchmark re-run confirmed".to_string());
        assert!(manual.validate(5.0).is_ok());

        manual.score_change = -7.5;
        assert!(manual.validate(5.0).is_err(), "over the cap");

        let mut correction = EventSubmission::signal("x", "fix-1", -3.0);
        correction.kind = EventKind::Correction;
        assert!(correction.validate(5.0).is_err());
        correction.note = Some("article misattributed".to_string());
        assert!(correction.validate(5.0).is_ok());
    }

    #[test]
    fn test_submission_json() {
        let json = r#"{"entity_id": "x", "source_event_id": "art-9", "score_change": -2.5,
                       "factor_attributions": {"adoption": -2.5}}"#;
        let submission: EventSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(submission.kind, EventKind::Signal);
        assert_eq!(submission.factor_attributions["adoption"], -2.5);
    }
}
