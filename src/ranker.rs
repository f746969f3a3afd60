// 🏆 Ranker - Total order, dense ranks, tiers from bands
//
// Order: current score descending, then entity id ascending.
// Ranks are 1..N with no gaps and no shared ranks; equal scores get adjacent
// ranks. Tiers come from the algorithm version's bands, not from code.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::entities::AlgorithmVersion;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity_id: String,
    pub score: f64,
}

impl ScoredEntity {
    pub fn new(entity_id: &str, score: f64) -> Self {
        ScoredEntity {
            entity_id: entity_id.to_string(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub entity_id: String,
    pub rank: u32,
    pub score: f64,
    pub tier: String,
}

/// Leaderboard order: higher score first, entity id breaks ties
pub fn leaderboard_order(a: &ScoredEntity, b: &ScoredEntity) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

pub struct Ranker<'v> {
    version: &'v AlgorithmVersion,
}

impl<'v> Ranker<'v> {
    pub fn new(version: &'v AlgorithmVersion) -> Self {
        Ranker { version }
    }

    /// Rank the given (active-only) entities
    pub fn rank(&self, mut scored: Vec<ScoredEntity>) -> EngineResult<Vec<RankedEntry>> {
        {
            let mut seen = BTreeSet::new();
            for entry in &scored {
                if !entry.score.is_finite() {
                    return Err(EngineError::validation(format!(
                        "score for {} is not finite",
                        entry.entity_id
                    )));
                }
                if !seen.insert(entry.entity_id.as_str()) {
                    return Err(EngineError::validation(format!(
                        "entity {} submitted twice for ranking",
                        entry.entity_id
                    )));
                }
            }
        }

        scored.sort_by(leaderboard_order);

        scored
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let rank = (i + 1) as u32;
                let tier = self.version.tier_for(rank).ok_or_else(|| {
                    EngineError::validation(format!(
                        "algorithm {} has no tier band for rank {}",
                        self.version.version, rank
                    ))
                })?;
                Ok(RankedEntry {
                    entity_id: entry.entity_id,
                    rank,
                    score: entry.score,
                    tier: tier.to_string(),
                })
            })
            .collect()
    }
}

/// Problems with a rank sequence: must be exactly 1..N in order, one row per entity
pub fn rank_problems<'a, I>(ranks: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, u32)>,
{
    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();

    for (i, (entity_id, rank)) in ranks.into_iter().enumerate() {
        let expected = (i + 1) as u32;
        if rank != expected {
            problems.push(format!(
                "position {} holds rank {} (entity {}), expected {}",
                i + 1,
                rank,
                entity_id,
                expected
            ));
        }
        if !seen.insert(entity_id) {
            problems.push(format!("entity {} appears more than once", entity_id));
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::algorithm::tests::sample_version;

    #[test]
    fn test_ties_get_adjacent_ranks() {
        let version = sample_version("7.2");
        let ranked = Ranker::new(&version)
            .rank(vec![ScoredEntity::new("b", 60.0), ScoredEntity::new("a", 60.0)])
            .unwrap();

        assert_eq!(ranked[0].entity_id, "a");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].entity_id, "b");
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn test_dense_ranks_and_tiers() {
        let version = sample_version("7.2");
        let scored: Vec<ScoredEntity> = (0..50)
            .map(|i| ScoredEntity::new(&format!("tool-{:02}", i), 100.0 - i as f64))
            .collect();

        let ranked = Ranker::new(&version).rank(scored).unwrap();

        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=50).collect::<Vec<u32>>());
        assert_eq!(ranked[19].rank, 20);
        assert_eq!(ranked[19].tier, "B");
        assert_eq!(ranked[0].tier, "S");
        assert_eq!(ranked[49].tier, "D");
        assert!(rank_problems(ranked.iter().map(|e| (e.entity_id.as_str(), e.rank))).is_empty());
    }

    #[test]
    fn test_order_is_input_independent() {
        let version = sample_version("7.2");
        let forward = vec![
            ScoredEntity::new("c", 70.0),
            ScoredEntity::new("a", 55.5),
            ScoredEntity::new("b", 70.0),
            ScoredEntity::new("d", 80.25),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let ranker = Ranker::new(&version);
        assert_eq!(ranker.rank(forward).unwrap(), ranker.rank(reversed).unwrap());
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let version = sample_version("7.2");
        let err = Ranker::new(&version)
            .rank(vec![ScoredEntity::new("a", 60.0), ScoredEntity::new("a", 61.0)])
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_rank_problems_flags_gaps_and_repeats() {
        let problems = rank_problems(vec![("a", 1), ("b", 1), ("c", 4)]);
        assert_eq!(problems.len(), 2);

        let repeats = rank_problems(vec![("a", 1), ("a", 2)]);
        assert_eq!(repeats.len(), 1);
    }
}
