// 🧮 Ranking Engine - Operations over the ledgers and snapshots
//
// Every write runs in an IMMEDIATE transaction so writers on separate
// connections serialize on the database, not on anything in this process.
// Publishing is a compare-and-swap on the current snapshot pointer.

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::{
    get_events_for_entity, insert_event, open_database, setup_database, AuditEvent,
};
use crate::entities::{AlgorithmRegistry, AlgorithmVersion, Entity, EntityRoster};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{BaselineLedger, BaselineRecord, DeltaLedger, EventSubmission, ScoringEvent};
use crate::metrics::{EpochMetrics, MetricMap, MetricStore};
use crate::movement::{Movement, MovementTracker};
use crate::normalizer::{FactorScore, MetricsNormalizer, NormalizedFactors};
use crate::projector::{CurrentScoreProjector, InvariantViolation, ProjectedScore};
use crate::ranker::{Ranker, ScoredEntity};
use crate::scoring::WeightedScoringEngine;
use crate::snapshot::{
    check_entries, content_hash, RankingSnapshot, SnapshotEntry, SnapshotStatus, SnapshotStore,
    SnapshotSummary,
};

const ENGINE_ACTOR: &str = "engine";

/// Result of handing an event to the delta ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        event: ScoringEvent,
        /// None while the entity has no baseline yet
        current_score: Option<f64>,
    },
    /// Seen before; nothing was written
    Duplicate {
        idempotency_key: String,
        entity_id: String,
    },
}

impl ApplyOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApplyOutcome::Duplicate { .. })
    }
}

pub struct RankingEngine {
    conn: Connection,
    config: EngineConfig,
}

impl RankingEngine {
    /// Wrap an injected connection (schema is applied if missing)
    pub fn new(conn: Connection, config: EngineConfig) -> EngineResult<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        setup_database(&conn)?;
        Ok(RankingEngine { conn, config })
    }

    /// Open the database file named in the config
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let conn = open_database(&config.database_path, config.busy_timeout_ms)?;
        Ok(RankingEngine { conn, config })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // ROSTER & ALGORITHMS
    // ========================================================================

    pub fn register_entity(&mut self, entity: &Entity) -> EngineResult<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        EntityRoster::new(&tx).register(entity)?;
        audit(
            &tx,
            "entity_registered",
            "entity",
            &entity.id,
            json!({"name": entity.name, "subject": entity.subject, "category": entity.category}),
        )?;
        tx.commit()?;

        info!(entity = %entity.id, subject = %entity.subject, "Entity registered");
        Ok(())
    }

    pub fn redirect_entity(&mut self, entity_id: &str, canonical_id: &str) -> EngineResult<Entity> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entity = EntityRoster::new(&tx).redirect(entity_id, canonical_id)?;
        audit(
            &tx,
            "entity_redirected",
            "entity",
            entity_id,
            json!({"canonical_id": canonical_id}),
        )?;
        tx.commit()?;

        info!(entity = %entity_id, canonical = %canonical_id, "Entity redirected");
        Ok(entity)
    }

    /// Every entity regardless of status
    pub fn list_entities(&self) -> EngineResult<Vec<Entity>> {
        EntityRoster::new(&self.conn).all()
    }

    pub fn retire_entity(&mut self, entity_id: &str) -> EngineResult<Entity> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entity = EntityRoster::new(&tx).retire(entity_id)?;
        audit(&tx, "entity_retired", "entity", entity_id, json!({}))?;
        tx.commit()?;

        info!(entity = %entity_id, "Entity retired");
        Ok(entity)
    }

    pub fn register_algorithm_version(&mut self, version: &AlgorithmVersion) -> EngineResult<()> {
        let tolerance = self.config.weight_tolerance;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        AlgorithmRegistry::new(&tx).register(version, tolerance)?;
        audit(
            &tx,
            "algorithm_registered",
            "algorithm_version",
            &version.version,
            json!({"weights": version.weights}),
        )?;
        tx.commit()?;

        info!(
            version = %version.version,
            factors = version.weights.len(),
            "Algorithm version registered"
        );
        Ok(())
    }

    /// Freeze a provider snapshot under `epoch`; returns the entity count
    pub fn record_metrics(&mut self, epoch: &str, metrics: &EpochMetrics) -> EngineResult<usize> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let count = MetricStore::new(&tx).record_epoch(epoch, metrics)?;
        audit(&tx, "metrics_recorded", "metric_epoch", epoch, json!({"entities": count}))?;
        tx.commit()?;

        info!(epoch = %epoch, entities = count, "Metrics epoch recorded");
        Ok(count)
    }

    // ========================================================================
    // SCORING
    // ========================================================================

    /// Factor scores of an active entity from the latest metrics epoch
    pub fn compute_factor_scores(
        &self,
        entity_id: &str,
        version: &str,
    ) -> EngineResult<Vec<FactorScore>> {
        let (normalized, _) = self.normalize_latest(entity_id, version)?;
        Ok(normalized.to_factor_scores(Utc::now()))
    }

    /// Overall score of an active entity from the latest metrics epoch
    pub fn compute_overall_score(&self, entity_id: &str, version: &str) -> EngineResult<f64> {
        let (normalized, algorithm) = self.normalize_latest(entity_id, version)?;
        WeightedScoringEngine::new(self.config.weight_tolerance)
            .score_normalized(&normalized, &algorithm)
    }

    fn normalize_latest(
        &self,
        entity_id: &str,
        version: &str,
    ) -> EngineResult<(NormalizedFactors, AlgorithmVersion)> {
        let algorithm = AlgorithmRegistry::new(&self.conn).require(version)?;
        require_active(&self.conn, entity_id)?;

        let epoch = MetricStore::new(&self.conn)
            .latest_epoch()?
            .ok_or_else(|| EngineError::not_found("metrics epoch", "latest"))?;
        let population = active_population(&self.conn, &epoch)?;
        let normalizer = MetricsNormalizer::calibrate(&algorithm, &population);

        let normalized = normalize_entity(&normalizer, &population, entity_id);
        Ok((normalized, algorithm))
    }

    // ========================================================================
    // BASELINES
    // ========================================================================

    pub fn establish_baseline(
        &mut self,
        entity_id: &str,
        epoch: &str,
        version: &str,
    ) -> EngineResult<BaselineRecord> {
        let scorer = WeightedScoringEngine::new(self.config.weight_tolerance);
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let algorithm = AlgorithmRegistry::new(&tx).require(version)?;
        require_active(&tx, entity_id)?;
        let population = active_population(&tx, epoch)?;
        let normalizer = MetricsNormalizer::calibrate(&algorithm, &population);

        let record = freeze_baseline(
            &tx,
            &scorer,
            &normalizer,
            &population,
            entity_id,
            epoch,
            &algorithm,
        )?;
        tx.commit()?;

        Ok(record)
    }

    /// Baselines for every active entity of the epoch, all or nothing
    pub fn establish_baselines(
        &mut self,
        epoch: &str,
        version: &str,
    ) -> EngineResult<Vec<BaselineRecord>> {
        let scorer = WeightedScoringEngine::new(self.config.weight_tolerance);
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let algorithm = AlgorithmRegistry::new(&tx).require(version)?;
        let population = active_population(&tx, epoch)?;
        let normalizer = MetricsNormalizer::calibrate(&algorithm, &population);

        let mut records = Vec::new();
        for entity in EntityRoster::new(&tx).active()? {
            records.push(freeze_baseline(
                &tx,
                &scorer,
                &normalizer,
                &population,
                &entity.id,
                epoch,
                &algorithm,
            )?);
        }
        tx.commit()?;

        info!(
            epoch = %epoch,
            version = %version,
            baselines = records.len(),
            "Baselines established"
        );
        Ok(records)
    }

    // ========================================================================
    // DELTAS
    // ========================================================================

    pub fn apply_event(&mut self, submission: &EventSubmission) -> EngineResult<ApplyOutcome> {
        submission.validate(self.config.max_manual_adjustment)?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let roster = EntityRoster::new(&tx);
        if roster.get(&submission.entity_id)?.is_none() {
            return Err(EngineError::validation(format!(
                "event {} names unknown entity {}",
                submission.source_event_id, submission.entity_id
            )));
        }
        let entity = roster.resolve_canonical(&submission.entity_id)?;
        if entity.id != submission.entity_id {
            info!(
                source_event = %submission.source_event_id,
                from = %submission.entity_id,
                to = %entity.id,
                "Event re-attributed to canonical entity"
            );
        }

        let deltas = DeltaLedger::new(&tx);
        if let Some(corrected_id) = &submission.corrects {
            match deltas.get(corrected_id)? {
                Some(original) if original.entity_id == entity.id => {}
                Some(original) => {
                    return Err(EngineError::validation(format!(
                        "event {} corrects {} which belongs to {}, not {}",
                        submission.source_event_id, corrected_id, original.entity_id, entity.id
                    )))
                }
                None => {
                    return Err(EngineError::validation(format!(
                        "event {} corrects unknown event {}",
                        submission.source_event_id, corrected_id
                    )))
                }
            }
        }

        let event = ScoringEvent::from_submission(submission, &entity.id);
        let stored = match deltas.append(&event)? {
            Some(stored) => stored,
            None => {
                info!(
                    source_event = %submission.source_event_id,
                    entity = %entity.id,
                    "Duplicate event absorbed"
                );
                return Ok(ApplyOutcome::Duplicate {
                    idempotency_key: event.idempotency_key,
                    entity_id: entity.id,
                });
            }
        };

        let projected = CurrentScoreProjector::new(&tx).refresh(&entity.id)?;
        let actor = submission.actor.as_deref().unwrap_or(ENGINE_ACTOR);
        insert_event(
            &tx,
            &AuditEvent::new(
                "event_applied",
                "entity",
                &entity.id,
                json!({
                    "event_id": stored.id,
                    "source_event_id": stored.source_event_id,
                    "kind": stored.kind.as_str(),
                    "score_change": stored.score_change,
                }),
                actor,
            ),
        )?;
        tx.commit()?;

        let current_score = projected.map(|p| p.current_score);
        info!(
            entity = %entity.id,
            source_event = %stored.source_event_id,
            kind = stored.kind.as_str(),
            score_change = stored.score_change,
            current = ?current_score,
            "Event applied"
        );

        Ok(ApplyOutcome::Applied {
            event: stored,
            current_score,
        })
    }

    pub fn projection(&self, entity_id: &str) -> EngineResult<ProjectedScore> {
        CurrentScoreProjector::new(&self.conn).current_score(entity_id)
    }

    /// baseline + Σ deltas since that baseline
    pub fn current_score(&self, entity_id: &str) -> EngineResult<f64> {
        Ok(self.projection(entity_id)?.current_score)
    }

    /// Σ scoreChange since the baseline of `since_epoch` (latest baseline when None)
    pub fn delta_score(&self, entity_id: &str, since_epoch: Option<&str>) -> EngineResult<f64> {
        let baselines = BaselineLedger::new(&self.conn);
        let baseline = match since_epoch {
            Some(epoch) => baselines.get(entity_id, epoch)?,
            None => baselines.latest(entity_id)?,
        }
        .ok_or_else(|| {
            EngineError::not_found(
                "baseline",
                format!("{}@{}", entity_id, since_epoch.unwrap_or("latest")),
            )
        })?;

        DeltaLedger::new(&self.conn).delta_since(entity_id, baseline.ledger_seq)
    }

    /// Every baseline of the entity, oldest epoch first
    pub fn baseline_history(&self, entity_id: &str) -> EngineResult<Vec<BaselineRecord>> {
        EntityRoster::new(&self.conn).require(entity_id)?;
        BaselineLedger::new(&self.conn).history(entity_id)
    }

    pub fn events_for(&self, entity_id: &str) -> EngineResult<Vec<ScoringEvent>> {
        DeltaLedger::new(&self.conn).events_for(entity_id)
    }

    pub fn verify_invariant(&self) -> EngineResult<Vec<InvariantViolation>> {
        let tolerance = self.config.invariant_tolerance;
        let violations = CurrentScoreProjector::new(&self.conn).verify_invariant(tolerance)?;
        for violation in &violations {
            warn!(%violation, "Invariant violation");
        }
        Ok(violations)
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    /// Rank active entities into a draft. Identical inputs give the same draft back.
    pub fn generate_snapshot(
        &mut self,
        period: &str,
        version: &str,
    ) -> EngineResult<RankingSnapshot> {
        if period.trim().is_empty() {
            return Err(EngineError::validation("snapshot period must not be empty"));
        }
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let algorithm = AlgorithmRegistry::new(&tx).require(version)?;
        let active = EntityRoster::new(&tx).active()?;
        let projections = CurrentScoreProjector::new(&tx).active_scores()?;
        let baselines = BaselineLedger::new(&tx);

        let mut scored = Vec::with_capacity(active.len());
        let mut names: BTreeMap<&str, &str> = BTreeMap::new();
        let mut factors: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for entity in &active {
            let missing_baseline =
                || EngineError::validation(format!("active entity {} has no baseline", entity.id));
            let projection = projections.get(&entity.id).ok_or_else(missing_baseline)?;
            let baseline = baselines.latest(&entity.id)?.ok_or_else(missing_baseline)?;
            if baseline.algorithm_version != algorithm.version {
                warn!(
                    entity = %entity.id,
                    baseline_version = %baseline.algorithm_version,
                    version = %algorithm.version,
                    "Baseline was scored under a different algorithm version"
                );
            }

            scored.push(ScoredEntity::new(&entity.id, projection.current_score));
            names.insert(entity.id.as_str(), entity.name.as_str());
            factors.insert(entity.id.clone(), baseline.factor_scores);
        }

        let ranked = Ranker::new(&algorithm).rank(scored)?;
        let store = SnapshotStore::new(&tx);
        let previous = store.current()?;
        let tracker = MovementTracker::new(self.config.major_move_threshold, &algorithm.weights);
        let (movements, dropped) = tracker.track(&ranked, &factors, previous.as_ref());

        let entries: Vec<SnapshotEntry> = ranked
            .into_iter()
            .zip(movements)
            .map(|(entry, movement)| SnapshotEntry {
                name: names
                    .get(entry.entity_id.as_str())
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                factor_scores: factors.remove(&entry.entity_id).unwrap_or_default(),
                entity_id: entry.entity_id,
                rank: entry.rank,
                score: entry.score,
                tier: entry.tier,
                movement,
            })
            .collect();

        let based_on = previous.map(|p| p.id);
        let hash = content_hash(
            period,
            &algorithm.version,
            based_on.as_deref(),
            &entries,
            &dropped,
        )?;

        if let Some(existing) = store.find_draft_by_hash(&hash)? {
            debug!(snapshot = %existing.id, "Identical draft already exists");
            return Ok(existing);
        }

        let snapshot = RankingSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            period: period.to_string(),
            algorithm_version: algorithm.version.clone(),
            status: SnapshotStatus::Draft,
            based_on,
            content_hash: hash,
            entries,
            dropped,
            generated_at: Utc::now(),
            published_at: None,
            superseded_at: None,
        };
        store.insert_draft(&snapshot)?;
        audit(
            &tx,
            "snapshot_generated",
            "snapshot",
            &snapshot.id,
            json!({
                "period": snapshot.period,
                "algorithm_version": snapshot.algorithm_version,
                "entries": snapshot.entries.len(),
                "based_on": snapshot.based_on,
            }),
        )?;
        tx.commit()?;

        info!(
            snapshot = %snapshot.id,
            period = %period,
            entries = snapshot.entries.len(),
            dropped = snapshot.dropped.len(),
            "Snapshot generated"
        );
        Ok(snapshot)
    }

    /// Verify, then make the draft current and supersede the old current, in one transaction
    pub fn publish_snapshot(&mut self, snapshot_id: &str) -> EngineResult<RankingSnapshot> {
        let tolerance = self.config.invariant_tolerance;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let store = SnapshotStore::new(&tx);

        let draft = store.require(snapshot_id)?;
        if draft.status != SnapshotStatus::Draft {
            return Err(EngineError::InvalidTransition {
                kind: "snapshot",
                id: snapshot_id.to_string(),
                reason: format!(
                    "status is {}, only a draft can be published",
                    draft.status.as_str()
                ),
            });
        }

        let current_id = store.current_id()?;
        if current_id != draft.based_on {
            warn!(
                snapshot = %snapshot_id,
                based_on = ?draft.based_on,
                current = ?current_id,
                "Publish conflict: current snapshot moved"
            );
            return Err(EngineError::ConcurrentPublishConflict {
                expected: draft.based_on,
                actual: current_id,
            });
        }

        let mut violations = CurrentScoreProjector::new(&tx).verify_invariant(tolerance)?;
        let active_ids: BTreeSet<String> = EntityRoster::new(&tx)
            .active()?
            .into_iter()
            .map(|e| e.id)
            .collect();
        violations.extend(check_entries(&draft, &active_ids));
        if !violations.is_empty() {
            for violation in &violations {
                warn!(snapshot = %snapshot_id, %violation, "Publish blocked");
            }
            return Err(EngineError::InvariantViolation(violations));
        }

        let now = Utc::now();
        let superseded = store.supersede_current(now)?;
        store.mark_current(snapshot_id, now)?;
        audit(
            &tx,
            "snapshot_published",
            "snapshot",
            snapshot_id,
            json!({"period": draft.period, "superseded": superseded}),
        )?;
        tx.commit()?;

        info!(snapshot = %snapshot_id, superseded = ?superseded, "Snapshot published");
        SnapshotStore::new(&self.conn).require(snapshot_id)
    }

    /// Generate + publish, regenerating when another publisher got there first
    pub fn regenerate_and_publish(
        &mut self,
        period: &str,
        version: &str,
        max_attempts: u32,
    ) -> EngineResult<RankingSnapshot> {
        if max_attempts == 0 {
            return Err(EngineError::validation("max_attempts must be at least 1"));
        }

        let mut attempt = 1;
        loop {
            let draft = self.generate_snapshot(period, version)?;
            match self.publish_snapshot(&draft.id) {
                Ok(published) => return Ok(published),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Retrying publish");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get_current_snapshot(&self) -> EngineResult<RankingSnapshot> {
        SnapshotStore::new(&self.conn)
            .current()?
            .ok_or_else(|| EngineError::not_found("snapshot", "current"))
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> EngineResult<RankingSnapshot> {
        SnapshotStore::new(&self.conn).require(snapshot_id)
    }

    pub fn list_snapshots(&self) -> EngineResult<Vec<SnapshotSummary>> {
        SnapshotStore::new(&self.conn).list()
    }

    /// Movement of an entity in the current snapshot
    pub fn get_movement(&self, entity_id: &str) -> EngineResult<Movement> {
        let current = self.get_current_snapshot()?;
        current
            .entry(entity_id)
            .map(|e| e.movement.clone())
            .ok_or_else(|| EngineError::not_found("snapshot entry", entity_id))
    }

    pub fn audit_trail(&self, entity_type: &str, entity_id: &str) -> EngineResult<Vec<AuditEvent>> {
        get_events_for_entity(&self.conn, entity_type, entity_id)
    }
}

// ============================================================================
// HELPERS (take a connection so they run inside the caller's transaction)
// ============================================================================

fn audit(
    conn: &Connection,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    data: serde_json::Value,
) -> EngineResult<()> {
    insert_event(
        conn,
        &AuditEvent::new(event_type, entity_type, entity_id, data, ENGINE_ACTOR),
    )
}

fn require_active(conn: &Connection, entity_id: &str) -> EngineResult<Entity> {
    let entity = EntityRoster::new(conn).require(entity_id)?;
    if !entity.is_active() {
        return Err(EngineError::validation(format!(
            "entity {} is {} and cannot be scored",
            entity_id,
            entity.status.as_str()
        )));
    }
    Ok(entity)
}

/// The epoch's metrics restricted to active entities (the calibration population)
fn active_population(conn: &Connection, epoch: &str) -> EngineResult<EpochMetrics> {
    let mut metrics = MetricStore::new(conn).load_epoch(epoch)?;
    let active: BTreeSet<String> = EntityRoster::new(conn)
        .active()?
        .into_iter()
        .map(|e| e.id)
        .collect();
    metrics.retain(|entity_id, _| active.contains(entity_id));
    Ok(metrics)
}

fn normalize_entity(
    normalizer: &MetricsNormalizer,
    population: &EpochMetrics,
    entity_id: &str,
) -> NormalizedFactors {
    let empty = MetricMap::new();
    let metrics = population.get(entity_id).unwrap_or(&empty);
    let normalized = normalizer.normalize(entity_id, metrics);
    for warning in &normalized.warnings {
        warn!(%warning, "Missing metric");
    }
    normalized
}

fn freeze_baseline(
    conn: &Connection,
    scorer: &WeightedScoringEngine,
    normalizer: &MetricsNormalizer,
    population: &EpochMetrics,
    entity_id: &str,
    epoch: &str,
    algorithm: &AlgorithmVersion,
) -> EngineResult<BaselineRecord> {
    let normalized = normalize_entity(normalizer, population, entity_id);
    let score = scorer.score_normalized(&normalized, algorithm)?;

    let record = BaselineLedger::new(conn).insert(
        entity_id,
        epoch,
        score,
        &algorithm.version,
        &normalized.scores,
    )?;
    CurrentScoreProjector::new(conn).refresh(entity_id)?;
    audit(
        conn,
        "baseline_established",
        "entity",
        entity_id,
        json!({"epoch": epoch, "score": score, "algorithm_version": algorithm.version}),
    )?;

    debug!(entity = %entity_id, epoch = %epoch, score, "Baseline established");
    Ok(record)
}
