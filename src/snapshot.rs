// 📸 Snapshot Store - Draft → current → superseded
//
// Entries are written once at generation and never rewritten (a trigger
// enforces it). Publishing only moves the status pointer forward, and the
// partial unique index guarantees at most one current snapshot.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::db::{json_column, optional_timestamp_column, timestamp_column};
use crate::error::{EngineError, EngineResult};
use crate::movement::{DroppedEntry, Movement};
use crate::projector::InvariantViolation;
use crate::ranker::rank_problems;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Draft,
    Current,
    Superseded,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Draft => "draft",
            SnapshotStatus::Current => "current",
            SnapshotStatus::Superseded => "superseded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(SnapshotStatus::Draft),
            "current" => Some(SnapshotStatus::Current),
            "superseded" => Some(SnapshotStatus::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub entity_id: String,
    pub name: String,
    pub rank: u32,
    pub score: f64,
    pub tier: String,
    pub factor_scores: BTreeMap<String, f64>,
    pub movement: Movement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub id: String,
    pub period: String,
    pub algorithm_version: String,
    pub status: SnapshotStatus,

    /// Snapshot that was current when this one was generated
    pub based_on: Option<String>,

    pub content_hash: String,
    pub entries: Vec<SnapshotEntry>,
    pub dropped: Vec<DroppedEntry>,
    pub generated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl RankingSnapshot {
    pub fn is_current(&self) -> bool {
        self.status == SnapshotStatus::Current
    }

    pub fn entry(&self, entity_id: &str) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.entity_id == entity_id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_raw: String = row.get(3)?;
        let status = SnapshotStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown snapshot status '{}'", status_raw).into(),
            )
        })?;

        Ok(RankingSnapshot {
            id: row.get(0)?,
            period: row.get(1)?,
            algorithm_version: row.get(2)?,
            status,
            based_on: row.get(4)?,
            content_hash: row.get(5)?,
            entries: json_column(row, 6)?,
            dropped: json_column(row, 7)?,
            generated_at: timestamp_column(row, 8)?,
            published_at: optional_timestamp_column(row, 9)?,
            superseded_at: optional_timestamp_column(row, 10)?,
        })
    }
}

/// Listing row, without the entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub period: String,
    pub algorithm_version: String,
    pub status: SnapshotStatus,
    pub entry_count: usize,
    pub generated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<&RankingSnapshot> for SnapshotSummary {
    fn from(snapshot: &RankingSnapshot) -> Self {
        SnapshotSummary {
            id: snapshot.id.clone(),
            period: snapshot.period.clone(),
            algorithm_version: snapshot.algorithm_version.clone(),
            status: snapshot.status,
            entry_count: snapshot.entries.len(),
            generated_at: snapshot.generated_at,
            published_at: snapshot.published_at,
        }
    }
}

/// SHA-256 over everything that makes a draft what it is (timestamps excluded)
pub fn content_hash(
    period: &str,
    algorithm_version: &str,
    based_on: Option<&str>,
    entries: &[SnapshotEntry],
    dropped: &[DroppedEntry],
) -> EngineResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(period.as_bytes());
    hasher.update(b"|");
    hasher.update(algorithm_version.as_bytes());
    hasher.update(b"|");
    hasher.update(based_on.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(entries)?.as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(dropped)?.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Entry-level checks run before publish
pub fn check_entries(
    snapshot: &RankingSnapshot,
    active_ids: &BTreeSet<String>,
) -> Vec<InvariantViolation> {
    let mut violations: Vec<InvariantViolation> = rank_problems(
        snapshot
            .entries
            .iter()
            .map(|e| (e.entity_id.as_str(), e.rank)),
    )
    .into_iter()
    .map(|detail| InvariantViolation::RankCollision {
        snapshot_id: snapshot.id.clone(),
        detail,
    })
    .collect();

    let listed: BTreeSet<&str> = snapshot.entries.iter().map(|e| e.entity_id.as_str()).collect();

    for entity_id in &listed {
        if !active_ids.contains(*entity_id) {
            violations.push(InvariantViolation::InactiveEntry {
                snapshot_id: snapshot.id.clone(),
                entity_id: entity_id.to_string(),
            });
        }
    }

    for entity_id in active_ids {
        if !listed.contains(entity_id.as_str()) {
            violations.push(InvariantViolation::MissingEntry {
                snapshot_id: snapshot.id.clone(),
                entity_id: entity_id.clone(),
            });
        }
    }

    violations
}

// ============================================================================
// STORE
// ============================================================================

const SNAPSHOT_COLUMNS: &str = "id, period, algorithm_version, status, based_on, content_hash, \
     entries, dropped, generated_at, published_at, superseded_at";

pub struct SnapshotStore<'c> {
    conn: &'c Connection,
}

impl<'c> SnapshotStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SnapshotStore { conn }
    }

    pub fn insert_draft(&self, snapshot: &RankingSnapshot) -> EngineResult<()> {
        if snapshot.status != SnapshotStatus::Draft {
            return Err(EngineError::InvalidTransition {
                kind: "snapshot",
                id: snapshot.id.clone(),
                reason: "only drafts can be inserted".to_string(),
            });
        }

        self.conn.execute(
            "INSERT INTO ranking_snapshots (
                id, period, algorithm_version, status, based_on, content_hash,
                entries, dropped, generated_at
            ) VALUES (?1, ?2, ?3, 'draft', ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.id,
                snapshot.period,
                snapshot.algorithm_version,
                snapshot.based_on,
                snapshot.content_hash,
                serde_json::to_string(&snapshot.entries)?,
                serde_json::to_string(&snapshot.dropped)?,
                snapshot.generated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// A draft with identical content, if one was generated before
    pub fn find_draft_by_hash(&self, hash: &str) -> EngineResult<Option<RankingSnapshot>> {
        let sql = format!(
            "SELECT {} FROM ranking_snapshots
             WHERE content_hash = ?1 AND status = 'draft'
             ORDER BY rowid LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![hash], RankingSnapshot::from_row)
            .optional()?)
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<RankingSnapshot>> {
        let sql = format!("SELECT {} FROM ranking_snapshots WHERE id = ?1", SNAPSHOT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], RankingSnapshot::from_row)
            .optional()?)
    }

    pub fn require(&self, id: &str) -> EngineResult<RankingSnapshot> {
        self.get(id)?
            .ok_or_else(|| EngineError::not_found("snapshot", id))
    }

    pub fn current(&self) -> EngineResult<Option<RankingSnapshot>> {
        let sql = format!(
            "SELECT {} FROM ranking_snapshots WHERE status = 'current'",
            SNAPSHOT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [], RankingSnapshot::from_row)
            .optional()?)
    }

    pub fn current_id(&self) -> EngineResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM ranking_snapshots WHERE status = 'current'",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All snapshots, oldest first
    pub fn list(&self) -> EngineResult<Vec<SnapshotSummary>> {
        let sql = format!("SELECT {} FROM ranking_snapshots ORDER BY rowid", SNAPSHOT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let snapshots = stmt
            .query_map([], RankingSnapshot::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots.iter().map(SnapshotSummary::from).collect())
    }

    /// Move the current snapshot (if any) to superseded; returns its id
    pub fn supersede_current(&self, now: DateTime<Utc>) -> EngineResult<Option<String>> {
        let current = match self.current_id()? {
            Some(id) => id,
            None => return Ok(None),
        };
        self.conn.execute(
            "UPDATE ranking_snapshots SET status = 'superseded', superseded_at = ?2
             WHERE id = ?1 AND status = 'current'",
            params![current, now.to_rfc3339()],
        )?;
        Ok(Some(current))
    }

    /// Draft → current. The caller supersedes the old current first.
    pub fn mark_current(&self, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let updated = self.conn.execute(
            "UPDATE ranking_snapshots SET status = 'current', published_at = ?2
             WHERE id = ?1 AND status = 'draft'",
            params![id, now.to_rfc3339()],
        )?;

        if updated == 0 {
            return Err(EngineError::InvalidTransition {
                kind: "snapshot",
                id: id.to_string(),
                reason: "only a draft can be published".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::algorithm::tests::sample_version;
    use crate::entities::AlgorithmRegistry;

    /// Draft snapshot with the given (entity, rank, score) rows
    pub(crate) fn snapshot_with(rows: &[(&str, u32, f64)]) -> RankingSnapshot {
        let entries: Vec<SnapshotEntry> = rows
            .iter()
            .map(|(id, rank, score)| SnapshotEntry {
                entity_id: id.to_string(),
                name: id.to_uppercase(),
                rank: *rank,
                score: *score,
                tier: "S".to_string(),
                factor_scores: BTreeMap::new(),
                movement: Movement::new_entry(),
            })
            .collect();
        let content_hash = content_hash("2025-07", "7.2", None, &entries, &[]).unwrap();

        RankingSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            period: "2025-07".to_string(),
            algorithm_version: "7.2".to_string(),
            status: SnapshotStatus::Draft,
            based_on: None,
            content_hash,
            entries,
            dropped: Vec::new(),
            generated_at: Utc::now(),
            published_at: None,
            superseded_at: None,
        }
    }

    fn snapshot_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        AlgorithmRegistry::new(&conn)
            .register(&sample_version("7.2"), 1e-6)
            .unwrap();
        conn
    }

    #[test]
    fn test_draft_round_trip() {
        let conn = snapshot_db();
        let store = SnapshotStore::new(&conn);
        let draft = snapshot_with(&[("a", 1, 90.0), ("b", 2, 80.0)]);

        store.insert_draft(&draft).unwrap();
        let loaded = store.require(&draft.id).unwrap();

        assert_eq!(loaded.entries, draft.entries);
        assert_eq!(loaded.status, SnapshotStatus::Draft);
        assert!(store.current().unwrap().is_none());
        assert_eq!(
            store.find_draft_by_hash(&draft.content_hash).unwrap().map(|s| s.id),
            Some(draft.id.clone())
        );
    }

    #[test]
    fn test_single_current() {
        let conn = snapshot_db();
        let store = SnapshotStore::new(&conn);
        let first = snapshot_with(&[("a", 1, 90.0)]);
        let second = snapshot_with(&[("a", 1, 91.0)]);
        store.insert_draft(&first).unwrap();
        store.insert_draft(&second).unwrap();

        store.mark_current(&first.id, Utc::now()).unwrap();

        // Flipping a second one on without superseding is refused by the index
        assert!(store.mark_current(&second.id, Utc::now()).is_err());

        assert_eq!(store.supersede_current(Utc::now()).unwrap(), Some(first.id.clone()));
        store.mark_current(&second.id, Utc::now()).unwrap();

        let summaries = store.list().unwrap();
        assert_eq!(summaries[0].status, SnapshotStatus::Superseded);
        assert_eq!(summaries[1].status, SnapshotStatus::Current);
        assert_eq!(store.current_id().unwrap(), Some(second.id));
    }

    #[test]
    fn test_entries_are_immutable() {
        let conn = snapshot_db();
        let store = SnapshotStore::new(&conn);
        let draft = snapshot_with(&[("a", 1, 90.0)]);
        store.insert_draft(&draft).unwrap();

        assert!(conn
            .execute("UPDATE ranking_snapshots SET entries = '[]'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM ranking_snapshots", []).is_err());

        store.mark_current(&draft.id, Utc::now()).unwrap();
        // No reverse transition
        assert!(conn
            .execute("UPDATE ranking_snapshots SET status = 'draft'", [])
            .is_err());
        assert!(matches!(
            store.mark_current(&draft.id, Utc::now()).unwrap_err(),
            EngineError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_check_entries() {
        let snapshot = snapshot_with(&[("a", 1, 90.0), ("b", 1, 80.0), ("gone", 3, 70.0)]);
        let active: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let violations = check_entries(&snapshot, &active);

        assert!(violations
            .iter()
            .any(|v| matches!(v, InvariantViolation::RankCollision { .. })));
        assert!(violations.iter().any(|v| matches!(
            v,
            InvariantViolation::InactiveEntry { entity_id, .. } if entity_id == "gone"
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            InvariantViolation::MissingEntry { entity_id, .. } if entity_id == "c"
        )));
    }

    #[test]
    fn test_hash_ignores_timestamps() {
        let a = snapshot_with(&[("a", 1, 90.0)]);
        let b = snapshot_with(&[("a", 1, 90.0)]);
        assert_eq!(a.content_hash, b.content_hash);

        let c = snapshot_with(&[("a", 1, 90.5)]);
        assert_ne!(a.content_hash, c.content_hash);
    }
}
