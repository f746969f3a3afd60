// 🚨 Engine Errors
// One error enum for the whole library; the CLI wraps it in anyhow

use crate::projector::InvariantViolation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input or configuration. Fatal to the operation, never defaulted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The ledger or a snapshot is inconsistent. Blocks publishing.
    #[error("invariant violated ({} violation(s)): {}", .0.len(), summarize(.0))]
    InvariantViolation(Vec<InvariantViolation>),

    /// Another snapshot became current after this draft was generated.
    #[error("concurrent publish conflict: draft based on {expected:?}, current is {actual:?}")]
    ConcurrentPublishConflict {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("baseline already exists for entity {entity_id} at epoch {epoch}")]
    BaselineExists { entity_id: String, epoch: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition for {kind} {id}: {reason}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Only a lost publish race is worth retrying; everything else needs a fix first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentPublishConflict { .. })
    }
}

fn summarize(violations: &[InvariantViolation]) -> String {
    violations
        .iter()
        .take(3)
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
