// End-to-end: two engines on one database file, like two producers/publishers

use leaderboard_engine::{
    open_database, EngineConfig, EngineError, Entity, EpochMetrics, EventSubmission, RankingEngine,
    SnapshotStatus,
};
use std::collections::BTreeMap;
use std::thread;

const ALGORITHM: &str = r#"{
    "version": "7.2",
    "weights": {"adoption": 0.5, "benchmark": 0.3, "velocity": 0.2},
    "factors": {
        "adoption":  {"metric": "github_stars", "scale": "log", "clip_percentile": 95, "missing": "exclude"},
        "benchmark": {"metric": "swe_bench", "range": [0, 100]},
        "velocity":  {"metric": "commits_30d", "missing": "zero"}
    }
}"#;

fn config_for(path: &str) -> EngineConfig {
    EngineConfig {
        database_path: path.to_string(),
        ..EngineConfig::default()
    }
}

fn seed(engine: &mut RankingEngine, count: usize) {
    engine
        .register_algorithm_version(&serde_json::from_str(ALGORITHM).unwrap())
        .unwrap();

    let mut metrics = EpochMetrics::new();
    for i in 0..count {
        let id = format!("tool-{:02}", i);
        engine
            .register_entity(&Entity::new(&id, &id.to_uppercase(), &id, "ide", &id))
            .unwrap();
        let values = serde_json::json!({
            "github_stars": 1000 * (count - i),
            "swe_bench": 90.0 - i as f64,
            "commits_30d": 10 + i,
        });
        metrics.insert(id, serde_json::from_value(values).unwrap());
    }

    engine.record_metrics("2025-07", &metrics).unwrap();
    engine.establish_baselines("2025-07", "7.2").unwrap();
}

#[test]
fn test_concurrent_duplicate_events_count_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leaderboard.db");
    let path = path.to_str().unwrap().to_string();

    let mut engine = RankingEngine::open(config_for(&path)).unwrap();
    seed(&mut engine, 3);
    let before = engine.current_score("tool-01").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let mut producer = RankingEngine::open(config_for(&path)).unwrap();
                let mut duplicates = 0;
                for n in 0..5 {
                    let outcome = producer
                        .apply_event(&EventSubmission::signal(
                            "tool-01",
                            &format!("article-{}", n),
                            1.5,
                        ))
                        .unwrap();
                    if outcome.is_duplicate() {
                        duplicates += 1;
                    }
                }
                duplicates
            })
        })
        .collect();

    let duplicates: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // 4 producers × 5 events, only 5 distinct
    assert_eq!(duplicates, 15);
    assert_eq!(engine.events_for("tool-01").unwrap().len(), 5);
    assert!((engine.current_score("tool-01").unwrap() - (before + 7.5)).abs() < 0.01);
    assert!(engine.verify_invariant().unwrap().is_empty());

    println!("✅ Concurrent replay test PASSED");
}

#[test]
fn test_publish_conflict_between_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leaderboard.db");
    let path = path.to_str().unwrap();

    let mut first = RankingEngine::open(config_for(path)).unwrap();
    seed(&mut first, 3);
    let conn = open_database(path, 5_000).unwrap();
    let mut second = RankingEngine::new(conn, config_for(path)).unwrap();

    let a = first.generate_snapshot("2025-07", "7.2").unwrap();
    let b = second.generate_snapshot("2025-07-alt", "7.2").unwrap();
    assert_eq!(a.based_on, None);
    assert_eq!(b.based_on, None);

    first.publish_snapshot(&a.id).unwrap();

    match second.publish_snapshot(&b.id).unwrap_err() {
        EngineError::ConcurrentPublishConflict { expected, actual } => {
            assert_eq!(expected, None);
            assert_eq!(actual, Some(a.id.clone()));
        }
        other => panic!("expected publish conflict, got {:?}", other),
    }

    let published = second.regenerate_and_publish("2025-07-alt", "7.2", 3).unwrap();
    assert_eq!(published.based_on, Some(a.id.clone()));

    let summaries = first.list_snapshots().unwrap();
    let current: Vec<_> = summaries
        .iter()
        .filter(|s| s.status == SnapshotStatus::Current)
        .collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, published.id);
    assert_eq!(first.get_snapshot(&a.id).unwrap().status, SnapshotStatus::Superseded);
}

#[test]
fn test_fifty_entity_leaderboard() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leaderboard.db");
    let mut engine = RankingEngine::open(config_for(path.to_str().unwrap())).unwrap();
    seed(&mut engine, 50);

    let first = engine.regenerate_and_publish("2025-07", "7.2", 1).unwrap();
    assert_eq!(first.entries.len(), 50);

    let ranks: Vec<u32> = first.entries.iter().map(|e| e.rank).collect();
    assert_eq!(ranks, (1..=50).collect::<Vec<u32>>());

    let mut tiers: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &first.entries {
        *tiers.entry(entry.tier.as_str()).or_default() += 1;
    }
    assert_eq!(tiers["S"], 5);
    assert_eq!(tiers["A"], 10);
    assert_eq!(tiers["B"], 15);
    assert_eq!(tiers["C"], 15);
    assert_eq!(tiers["D"], 5);
    assert_eq!(first.entries[19].tier, "B");

    // Push the last entity to the top, retire one, publish again
    let last = first.entries[49].entity_id.clone();
    let retired = first.entries[10].entity_id.clone();
    engine
        .apply_event(&EventSubmission::signal(&last, "acquisition-news", 200.0))
        .unwrap();
    engine.retire_entity(&retired).unwrap();

    let second = engine.regenerate_and_publish("2025-08", "7.2", 1).unwrap();
    assert_eq!(second.entries.len(), 49);
    assert_eq!(second.entries[0].entity_id, last);
    assert_eq!(second.entries[0].movement.previous_position, Some(50));
    assert_eq!(second.entries[0].movement.change, Some(49));
    assert_eq!(second.dropped.len(), 1);
    assert_eq!(second.dropped[0].entity_id, retired);
    assert!(second
        .entries
        .iter()
        .all(|e| e.movement.previous_position.is_some()));

    let movement = engine.get_movement(&last).unwrap();
    assert_eq!(movement.previous_position, Some(50));
}
