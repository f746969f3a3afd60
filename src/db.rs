// 🗄️ Storage Layer - SQLite schema + audit trail
// Append-only tables are guarded by triggers, uniqueness by indexes.
// The engine never relies on in-process locks for correctness.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineResult;

/// Audit trail entry ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open a database file and apply the schema
pub fn open_database(path: &str, busy_timeout_ms: u64) -> EngineResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> EngineResult<()> {
    // WAL gives readers a stable snapshot while a writer commits
    // (in-memory databases answer "memory" and stay that way)
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;

    // ==========================================================================
    // Entities (config-owned) - one active or redirect entity per subject
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL,
            category TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('active', 'redirect', 'retired')),
            canonical_id TEXT REFERENCES entities(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Redirects keep their subject so a merged subject cannot come back
    conn.execute("DROP INDEX IF EXISTS idx_entities_active_subject", [])?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_subject_claim
            ON entities(subject) WHERE status IN ('active', 'redirect')",
        [],
    )?;

    // ==========================================================================
    // Algorithm versions - write-once
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS algorithm_versions (
            version TEXT PRIMARY KEY,
            definition TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Metric epochs - frozen provider snapshots
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metric_epochs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            epoch TEXT UNIQUE NOT NULL,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS metric_values (
            epoch TEXT NOT NULL REFERENCES metric_epochs(epoch),
            entity_id TEXT NOT NULL,
            metrics TEXT NOT NULL,
            PRIMARY KEY (epoch, entity_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Baseline ledger - write-once per (entity, epoch)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS baselines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL REFERENCES entities(id),
            epoch TEXT NOT NULL,
            score REAL NOT NULL,
            algorithm_version TEXT NOT NULL REFERENCES algorithm_versions(version),
            factor_scores TEXT NOT NULL,
            ledger_seq INTEGER NOT NULL,
            established_at TEXT NOT NULL,
            UNIQUE (entity_id, epoch)
        )",
        [],
    )?;

    // ==========================================================================
    // Delta ledger - append-only, idempotent by key
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scoring_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            entity_id TEXT NOT NULL REFERENCES entities(id),
            source_event_id TEXT NOT NULL,
            score_change REAL NOT NULL,
            factor_attributions TEXT NOT NULL,
            kind TEXT NOT NULL,
            actor TEXT,
            note TEXT,
            corrects TEXT,
            processed_at TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Projected current scores - rewritten with every ledger write
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS current_scores (
            entity_id TEXT PRIMARY KEY REFERENCES entities(id),
            baseline_id INTEGER NOT NULL REFERENCES baselines(id),
            baseline_score REAL NOT NULL,
            delta_total REAL NOT NULL,
            current_score REAL NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Ranking snapshots - immutable entries, single current pointer
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ranking_snapshots (
            id TEXT PRIMARY KEY,
            period TEXT NOT NULL,
            algorithm_version TEXT NOT NULL REFERENCES algorithm_versions(version),
            status TEXT NOT NULL CHECK (status IN ('draft', 'current', 'superseded')),
            based_on TEXT,
            content_hash TEXT NOT NULL,
            entries TEXT NOT NULL,
            dropped TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            published_at TEXT,
            superseded_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_single_current
            ON ranking_snapshots(status) WHERE status = 'current'",
        [],
    )?;

    // ==========================================================================
    // Audit log
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Immutability triggers
    // ==========================================================================
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS trg_algorithm_versions_no_update
            BEFORE UPDATE ON algorithm_versions
            BEGIN SELECT RAISE(ABORT, 'algorithm versions are immutable'); END;
         CREATE TRIGGER IF NOT EXISTS trg_algorithm_versions_no_delete
            BEFORE DELETE ON algorithm_versions
            BEGIN SELECT RAISE(ABORT, 'algorithm versions are immutable'); END;
         CREATE TRIGGER IF NOT EXISTS trg_metric_values_no_update
            BEFORE UPDATE ON metric_values
            BEGIN SELECT RAISE(ABORT, 'metric epochs are frozen'); END;
         CREATE TRIGGER IF NOT EXISTS trg_baselines_no_update
            BEFORE UPDATE ON baselines
            BEGIN SELECT RAISE(ABORT, 'baselines are write-once'); END;
         CREATE TRIGGER IF NOT EXISTS trg_baselines_no_delete
            BEFORE DELETE ON baselines
            BEGIN SELECT RAISE(ABORT, 'baselines are write-once'); END;
         CREATE TRIGGER IF NOT EXISTS trg_scoring_events_no_update
            BEFORE UPDATE ON scoring_events
            BEGIN SELECT RAISE(ABORT, 'scoring events are append-only'); END;
         CREATE TRIGGER IF NOT EXISTS trg_scoring_events_no_delete
            BEFORE DELETE ON scoring_events
            BEGIN SELECT RAISE(ABORT, 'scoring events are append-only'); END;
         CREATE TRIGGER IF NOT EXISTS trg_snapshots_entries_immutable
            BEFORE UPDATE OF period, algorithm_version, based_on, content_hash, entries, dropped
            ON ranking_snapshots
            BEGIN SELECT RAISE(ABORT, 'snapshot entries are immutable'); END;
         CREATE TRIGGER IF NOT EXISTS trg_snapshots_status_forward
            BEFORE UPDATE OF status ON ranking_snapshots
            WHEN NOT ((OLD.status = 'draft' AND NEW.status = 'current')
                   OR (OLD.status = 'current' AND NEW.status = 'superseded'))
            BEGIN SELECT RAISE(ABORT, 'snapshot status only moves forward'); END;
         CREATE TRIGGER IF NOT EXISTS trg_snapshots_no_delete
            BEFORE DELETE ON ranking_snapshots
            BEGIN SELECT RAISE(ABORT, 'snapshots are never deleted'); END;
         CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;",
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scoring_events_entity ON scoring_events(entity_id, seq)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_baselines_entity ON baselines(entity_id, id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &AuditEvent) -> EngineResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO audit_log (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get audit events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> EngineResult<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM audit_log
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok(AuditEvent {
                event_id: row.get(0)?,
                timestamp: timestamp_column(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: json_column(row, 5)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw, idx)
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(&s, idx)).transpose()
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
