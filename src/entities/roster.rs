// 🧰 Ranked Entities - Stable identity + lifecycle
//
// "Entity id is IDENTITY (never changes), name/slug are VALUES"
//
// Problem solved:
// - A renamed or merged tool used to keep its old record alive and show up
//   twice on the leaderboard
// - Now the old record becomes a redirect pointing at the canonical entity,
//   and storage allows one claim per subject: an active entity, or a redirect
//   that keeps the merged subject out of reach of new registrations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{is_constraint_violation, timestamp_column};
use crate::error::{EngineError, EngineResult};

/// Redirect chains longer than this are treated as a cycle
const MAX_REDIRECT_HOPS: usize = 16;

// ============================================================================
// ENTITY STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    /// Scored and ranked
    Active,

    /// Merged/renamed into `canonical_id`; never scored
    Redirect,

    /// Gone; never scored
    Retired,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Redirect => "redirect",
            EntityStatus::Retired => "retired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(EntityStatus::Active),
            "redirect" => Some(EntityStatus::Redirect),
            "retired" => Some(EntityStatus::Retired),
            _ => None,
        }
    }
}

// ============================================================================
// ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identity - NEVER changes
    pub id: String,

    pub name: String,
    pub slug: String,
    pub category: String,

    /// Real-world subject this entity stands for (one active or redirect entity each)
    pub subject: String,

    pub status: EntityStatus,

    /// Set only when status = redirect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new active entity
    pub fn new(id: &str, name: &str, slug: &str, category: &str, subject: &str) -> Self {
        let now = Utc::now();
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            category: category.to_string(),
            subject: subject.to_string(),
            status: EntityStatus::Active,
            canonical_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_raw: String = row.get(5)?;
        let status = EntityStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown entity status '{}'", status_raw).into(),
            )
        })?;

        Ok(Entity {
            id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            category: row.get(3)?,
            subject: row.get(4)?,
            status,
            canonical_id: row.get(6)?,
            created_at: timestamp_column(row, 7)?,
            updated_at: timestamp_column(row, 8)?,
        })
    }
}

const ENTITY_COLUMNS: &str =
    "id, name, slug, category, subject, status, canonical_id, created_at, updated_at";

// ============================================================================
// ENTITY ROSTER
// ============================================================================

/// Registry of ranked entities, backed by the `entities` table
pub struct EntityRoster<'c> {
    conn: &'c Connection,
}

impl<'c> EntityRoster<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        EntityRoster { conn }
    }

    /// Register a new active entity
    pub fn register(&self, entity: &Entity) -> EngineResult<()> {
        for (field, value) in [
            ("id", &entity.id),
            ("name", &entity.name),
            ("slug", &entity.slug),
            ("subject", &entity.subject),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!("entity {} must not be empty", field)));
            }
        }
        if !entity.is_active() {
            return Err(EngineError::validation(format!(
                "entity {} must be registered as active",
                entity.id
            )));
        }
        if self.get(&entity.id)?.is_some() {
            return Err(EngineError::validation(format!("entity {} already exists", entity.id)));
        }

        let result = self.conn.execute(
            "INSERT INTO entities (
                id, name, slug, category, subject, status, canonical_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
            params![
                entity.id,
                entity.name,
                entity.slug,
                entity.category,
                entity.subject,
                entity.status.as_str(),
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(EngineError::validation(format!(
                "subject '{}' is already claimed by an active or merged entity",
                entity.subject
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<Entity>> {
        let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], Entity::from_row)
            .optional()?)
    }

    pub fn require(&self, id: &str) -> EngineResult<Entity> {
        self.get(id)?.ok_or_else(|| EngineError::not_found("entity", id))
    }

    /// Active entities ordered by id
    pub fn active(&self) -> EngineResult<Vec<Entity>> {
        self.query(&format!(
            "SELECT {} FROM entities WHERE status = 'active' ORDER BY id",
            ENTITY_COLUMNS
        ))
    }

    /// Every entity regardless of status, ordered by id
    pub fn all(&self) -> EngineResult<Vec<Entity>> {
        self.query(&format!("SELECT {} FROM entities ORDER BY id", ENTITY_COLUMNS))
    }

    fn query(&self, sql: &str) -> EngineResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entities = stmt
            .query_map([], Entity::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// Follow redirects to the active entity that now represents `id`
    pub fn resolve_canonical(&self, id: &str) -> EngineResult<Entity> {
        let mut current = self.require(id)?;

        for _ in 0..MAX_REDIRECT_HOPS {
            match current.status {
                EntityStatus::Active => return Ok(current),
                EntityStatus::Retired => {
                    return Err(EngineError::validation(format!(
                        "entity {} is retired and cannot be scored",
                        current.id
                    )))
                }
                EntityStatus::Redirect => {
                    let target = current.canonical_id.clone().ok_or_else(|| {
                        EngineError::validation(format!(
                            "redirect {} has no canonical id",
                            current.id
                        ))
                    })?;
                    current = self.require(&target)?;
                }
            }
        }

        Err(EngineError::validation(format!("redirect chain from {} does not terminate", id)))
    }

    /// Turn an active entity into a redirect to another active entity.
    /// The redirect keeps its subject claim.
    pub fn redirect(&self, id: &str, canonical_id: &str) -> EngineResult<Entity> {
        if id == canonical_id {
            return Err(EngineError::validation(format!("entity {} cannot redirect to itself", id)));
        }

        let entity = self.require(id)?;
        if !entity.is_active() {
            return Err(EngineError::InvalidTransition {
                kind: "entity",
                id: id.to_string(),
                reason: format!("cannot redirect from status {}", entity.status.as_str()),
            });
        }

        let target = self.require(canonical_id)?;
        if !target.is_active() {
            return Err(EngineError::validation(format!(
                "redirect target {} is not active",
                canonical_id
            )));
        }

        self.conn.execute(
            "UPDATE entities SET status = 'redirect', canonical_id = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'active'",
            params![id, canonical_id, Utc::now().to_rfc3339()],
        )?;

        self.require(id)
    }

    /// Retire an active entity
    pub fn retire(&self, id: &str) -> EngineResult<Entity> {
        let entity = self.require(id)?;
        if !entity.is_active() {
            return Err(EngineError::InvalidTransition {
                kind: "entity",
                id: id.to_string(),
                reason: format!("cannot retire from status {}", entity.status.as_str()),
            });
        }

        self.conn.execute(
            "UPDATE entities SET status = 'retired', updated_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![id, Utc::now().to_rfc3339()],
        )?;

        self.require(id)
    }

    /// Subjects claimed by more than one active or redirect entity, with the
    /// offending ids. Empty unless the unique index was bypassed.
    pub fn duplicate_subject_claims(&self) -> EngineResult<Vec<(String, Vec<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, GROUP_CONCAT(id, ',') FROM entities
             WHERE status IN ('active', 'redirect')
             GROUP BY subject HAVING COUNT(*) > 1
             ORDER BY subject",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let subject: String = row.get(0)?;
                let ids: String = row.get(1)?;
                let mut ids: Vec<String> = ids.split(',').map(str::to_string).collect();
                ids.sort();
                Ok((subject, ids))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================
