// Leaderboard Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod engine;
pub mod entities;
pub mod error;
pub mod ledger;     // Baseline + delta ledgers
pub mod metrics;    // Frozen provider metric epochs
pub mod movement;
pub mod normalizer;
pub mod projector;  // Current score cache + invariant checks
pub mod ranker;
pub mod scoring;
pub mod snapshot;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::{
    AuditEvent,
    open_database, setup_database, insert_event, get_events_for_entity,
};
pub use engine::{ApplyOutcome, RankingEngine};
pub use entities::{
    AlgorithmRegistry, AlgorithmVersion, FactorDefinition, MissingPolicy, Scale, TierBand,
    default_tier_bands,
    Entity, EntityRoster, EntityStatus,
};
pub use error::{EngineError, EngineResult};
pub use ledger::{
    BaselineLedger, BaselineRecord, DeltaLedger,
    EventKind, EventSubmission, ScoringEvent, idempotency_key,
};
pub use metrics::{
    EpochMetrics, MetricMap, MetricStore, MetricValue,
    load_metrics_csv, load_metrics_json,
};
pub use movement::{
    ChangeCategory, Direction, DroppedEntry, FactorChange, Movement, MovementTracker,
};
pub use normalizer::{
    Calibration, FactorScore, MetricsNormalizer, MissingMetricWarning, NormalizedFactors,
};
pub use projector::{CurrentScoreProjector, InvariantViolation, ProjectedScore};
pub use ranker::{RankedEntry, Ranker, ScoredEntity};
pub use scoring::{round1, round2, WeightedScoringEngine};
pub use snapshot::{
    RankingSnapshot, SnapshotEntry, SnapshotStatus, SnapshotStore, SnapshotSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
