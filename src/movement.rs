// 📈 Movement Tracker - Rank changes between published snapshots
//
// Matching is by stable entity id only, never by name or position.
// change = previous_position − rank, so positive means the entity climbed.
//
// Each factor's share of the move is impact = (current − previous) × weight.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ranker::RankedEntry;
use crate::scoring::round2;
use crate::snapshot::RankingSnapshot;

/// A factor must move by more than this to name the reason for a rank change
pub const SIGNIFICANT_FACTOR_CHANGE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Same,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    MajorRise,
    Rise,
    Stable,
    Decline,
    MajorDecline,
    NewEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    /// Rank in the previous published snapshot; None for a new entrant
    pub previous_position: Option<u32>,

    /// previous_position − rank; None for a new entrant
    pub change: Option<i64>,

    pub direction: Direction,
    pub category: ChangeCategory,

    pub previous_score: Option<f64>,
    pub score_change: Option<f64>,

    /// score_change as a percentage of previous_score (100 when it was 0)
    #[serde(default)]
    pub percent_score_change: Option<f64>,

    /// Largest impact first
    #[serde(default)]
    pub factor_changes: Vec<FactorChange>,

    /// Factor with the largest impact among significant changes
    #[serde(default)]
    pub primary_factor: Option<String>,
}

impl Movement {
    pub fn new_entry() -> Self {
        Movement {
            previous_position: None,
            change: None,
            direction: Direction::New,
            category: ChangeCategory::NewEntry,
            previous_score: None,
            score_change: None,
            percent_score_change: None,
            factor_changes: Vec::new(),
            primary_factor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorChange {
    pub factor: String,
    pub previous: f64,
    pub current: f64,
    pub change: f64,

    /// change × factor weight: this factor's contribution to the score change
    pub impact: f64,
}

/// In the previous snapshot, missing from the new one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedEntry {
    pub entity_id: String,
    pub previous_position: u32,
    pub previous_score: f64,
}

type FactorScores = BTreeMap<String, f64>;

pub struct MovementTracker {
    major_move_threshold: i64,
    weights: BTreeMap<String, f64>,
}

impl MovementTracker {
    /// `weights` are the factor weights of the algorithm version being ranked
    pub fn new(major_move_threshold: i64, weights: &BTreeMap<String, f64>) -> Self {
        MovementTracker {
            major_move_threshold,
            weights: weights.clone(),
        }
    }

    /// Diff new entries against the predecessor (None = first publication).
    /// `factors` holds each entity's current factor scores.
    pub fn track(
        &self,
        entries: &[RankedEntry],
        factors: &BTreeMap<String, FactorScores>,
        previous: Option<&RankingSnapshot>,
    ) -> (Vec<Movement>, Vec<DroppedEntry>) {
        let prior: BTreeMap<&str, (u32, f64, &FactorScores)> = previous
            .map(|snapshot| {
                snapshot
                    .entries
                    .iter()
                    .map(|e| (e.entity_id.as_str(), (e.rank, e.score, &e.factor_scores)))
                    .collect()
            })
            .unwrap_or_default();

        let empty = FactorScores::new();
        let movements = entries
            .iter()
            .map(|entry| {
                let id = entry.entity_id.as_str();
                let current = factors.get(id).unwrap_or(&empty);
                self.movement(entry, current, prior.get(id).copied())
            })
            .collect();

        let present: BTreeSet<&str> = entries.iter().map(|e| e.entity_id.as_str()).collect();
        let mut dropped: Vec<DroppedEntry> = prior
            .iter()
            .filter(|(id, _)| !present.contains(*id))
            .map(|(id, (rank, score, _))| DroppedEntry {
                entity_id: id.to_string(),
                previous_position: *rank,
                previous_score: *score,
            })
            .collect();
        dropped.sort_by_key(|d| d.previous_position);

        (movements, dropped)
    }

    fn movement(
        &self,
        entry: &RankedEntry,
        current_factors: &FactorScores,
        prior: Option<(u32, f64, &FactorScores)>,
    ) -> Movement {
        let (previous_rank, previous_score, previous_factors) = match prior {
            Some(p) => p,
            None => return Movement::new_entry(),
        };

        let change = previous_rank as i64 - entry.rank as i64;
        let direction = match change {
            c if c > 0 => Direction::Up,
            c if c < 0 => Direction::Down,
            _ => Direction::Same,
        };

        let score_change = round2(entry.score - previous_score);
        let percent = if previous_score > 0.0 {
            round2(score_change / previous_score * 100.0)
        } else {
            100.0
        };

        let factor_changes = self.factor_changes(previous_factors, current_factors);
        let primary_factor = factor_changes
            .iter()
            .find(|fc| fc.change.abs() > SIGNIFICANT_FACTOR_CHANGE)
            .map(|fc| fc.factor.clone());

        Movement {
            previous_position: Some(previous_rank),
            change: Some(change),
            direction,
            category: self.categorize(change),
            previous_score: Some(previous_score),
            score_change: Some(score_change),
            percent_score_change: Some(percent),
            factor_changes,
            primary_factor,
        }
    }

    /// Per-factor breakdown, largest |impact| first. A factor absent on one
    /// side counts as 0 there; absent on both sides it is left out.
    fn factor_changes(&self, previous: &FactorScores, current: &FactorScores) -> Vec<FactorChange> {
        let mut changes: Vec<FactorChange> = self
            .weights
            .iter()
            .filter(|(factor, _)| previous.contains_key(*factor) || current.contains_key(*factor))
            .map(|(factor, weight)| {
                let before = previous.get(factor).copied().unwrap_or(0.0);
                let after = current.get(factor).copied().unwrap_or(0.0);
                let change = after - before;
                FactorChange {
                    factor: factor.clone(),
                    previous: before,
                    current: after,
                    change: round2(change),
                    impact: round2(change * weight),
                }
            })
            .collect();

        // Stable sort keeps factor-name order between equal impacts
        changes.sort_by(|a, b| b.impact.abs().total_cmp(&a.impact.abs()));
        changes
    }

    fn categorize(&self, change: i64) -> ChangeCategory {
        if change >= self.major_move_threshold {
            ChangeCategory::MajorRise
        } else if change >= 1 {
            ChangeCategory::Rise
        } else if change <= -self.major_move_threshold {
            ChangeCategory::MajorDecline
        } else if change <= -1 {
            ChangeCategory::Decline
        } else {
            ChangeCategory::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::snapshot_with;

    fn weights() -> BTreeMap<String, f64> {
        [("adoption", 0.5), ("benchmark", 0.3), ("velocity", 0.2)]
            .into_iter()
            .map(|(f, w)| (f.to_string(), w))
            .collect()
    }

    fn tracker() -> MovementTracker {
        MovementTracker::new(5, &weights())
    }

    fn no_factors() -> BTreeMap<String, FactorScores> {
        BTreeMap::new()
    }

    fn scores(pairs: &[(&str, f64)]) -> FactorScores {
        pairs.iter().map(|(f, v)| (f.to_string(), *v)).collect()
    }

    fn entry(id: &str, rank: u32, score: f64) -> RankedEntry {
        RankedEntry {
            entity_id: id.to_string(),
            rank,
            score,
            tier: "S".to_string(),
        }
    }

    #[test]
    fn test_first_publication_is_all_new() {
        let (movements, dropped) =
            tracker().track(&[entry("a", 1, 90.0), entry("b", 2, 80.0)], &no_factors(), None);

        assert!(movements.iter().all(|m| m.previous_position.is_none()));
        assert!(movements.iter().all(|m| m.direction == Direction::New));
        assert!(movements.iter().all(|m| m.factor_changes.is_empty()));
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_matches_by_entity_id() {
        let previous = snapshot_with(&[("a", 1, 90.0), ("b", 2, 80.0), ("gone", 3, 70.0)]);
        let (movements, dropped) = tracker().track(
            &[entry("b", 1, 91.0), entry("a", 2, 85.5), entry("fresh", 3, 60.0)],
            &no_factors(),
            Some(&previous),
        );

        assert_eq!(movements[0].previous_position, Some(2));
        assert_eq!(movements[0].change, Some(1));
        assert_eq!(movements[0].direction, Direction::Up);
        assert_eq!(movements[0].category, ChangeCategory::Rise);
        assert_eq!(movements[0].score_change, Some(11.0));
        assert_eq!(movements[0].percent_score_change, Some(13.75));

        assert_eq!(movements[1].change, Some(-1));
        assert_eq!(movements[1].direction, Direction::Down);
        assert_eq!(movements[1].score_change, Some(-4.5));

        assert_eq!(movements[2].previous_position, None);
        assert_eq!(movements[2].category, ChangeCategory::NewEntry);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].entity_id, "gone");
        assert_eq!(dropped[0].previous_position, 3);
    }

    #[test]
    fn test_major_moves() {
        let previous = snapshot_with(&[
            ("a", 1, 90.0),
            ("b", 2, 89.0),
            ("c", 3, 88.0),
            ("d", 4, 87.0),
            ("e", 5, 86.0),
            ("f", 6, 85.0),
        ]);
        let (movements, _) = tracker().track(
            &[
                entry("f", 1, 95.0),
                entry("b", 2, 89.0),
                entry("c", 3, 88.0),
                entry("d", 4, 87.0),
                entry("e", 5, 86.0),
                entry("a", 6, 50.0),
            ],
            &no_factors(),
            Some(&previous),
        );

        assert_eq!(movements[0].category, ChangeCategory::MajorRise);
        assert_eq!(movements[1].direction, Direction::Same);
        assert_eq!(movements[1].category, ChangeCategory::Stable);
        assert_eq!(movements[5].category, ChangeCategory::MajorDecline);
    }

    #[test]
    fn test_factor_changes_explain_the_move() {
        let mut previous = snapshot_with(&[("a", 1, 70.0), ("b", 2, 65.0)]);
        previous.entries[1].factor_scores =
            scores(&[("adoption", 60.0), ("benchmark", 70.0), ("velocity", 70.0)]);

        let mut factors = no_factors();
        factors.insert(
            "b".to_string(),
            scores(&[("adoption", 60.0), ("benchmark", 90.0), ("velocity", 65.0)]),
        );

        let (movements, _) = tracker().track(
            &[entry("b", 1, 70.0), entry("a", 2, 70.0)],
            &factors,
            Some(&previous),
        );

        let b = &movements[0];
        assert_eq!(b.direction, Direction::Up);
        assert_eq!(b.factor_changes.len(), 3);
        assert_eq!(b.factor_changes[0].factor, "benchmark");
        assert_eq!(b.factor_changes[0].change, 20.0);
        assert_eq!(b.factor_changes[0].impact, 6.0);
        assert_eq!(b.factor_changes[1].factor, "velocity");
        assert_eq!(b.factor_changes[1].impact, -1.0);
        assert_eq!(b.factor_changes[2].factor, "adoption");
        assert_eq!(b.factor_changes[2].impact, 0.0);
        assert_eq!(b.primary_factor.as_deref(), Some("benchmark"));

        // No factor scores on either side: nothing to explain
        let a = &movements[1];
        assert!(a.factor_changes.is_empty());
        assert_eq!(a.primary_factor, None);
        assert_eq!(a.percent_score_change, Some(0.0));

        println!("✅ Factor change test PASSED: benchmark drove the climb");
    }

    #[test]
    fn test_small_factor_moves_name_no_primary_factor() {
        let mut previous = snapshot_with(&[("a", 1, 0.0)]);
        previous.entries[0].factor_scores = scores(&[("adoption", 50.0), ("benchmark", 50.0)]);

        let mut factors = no_factors();
        factors.insert("a".to_string(), scores(&[("adoption", 50.4), ("benchmark", 49.8)]));

        let (movements, _) = tracker().track(&[entry("a", 1, 0.2)], &factors, Some(&previous));

        assert_eq!(movements[0].factor_changes[0].factor, "adoption");
        assert_eq!(movements[0].primary_factor, None);
        assert_eq!(movements[0].percent_score_change, Some(100.0));
    }
}
