use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use leaderboard_engine::{
    load_metrics_csv, load_metrics_json, AlgorithmVersion, ApplyOutcome, EngineConfig, Entity,
    EventSubmission, RankingEngine, RankingSnapshot,
};

/// Leaderboard engine admin CLI
#[derive(Parser, Debug)]
#[command(name = "leaderboard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides the config
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database schema
    Init,

    /// Register a new active entity
    AddEntity {
        id: String,
        name: String,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long, default_value = "uncategorized")]
        category: String,
        /// Real-world subject key (defaults to the id)
        #[arg(long)]
        subject: Option<String>,
    },

    /// Point an entity at its canonical entity
    Redirect { id: String, canonical: String },

    /// Retire an entity
    Retire { id: String },

    /// List every entity with its status
    Entities,

    /// Register an algorithm version from a JSON file
    RegisterVersion { file: PathBuf },

    /// Freeze a metrics epoch from a JSON or CSV file
    RecordMetrics { epoch: String, file: PathBuf },

    /// Establish baselines for every active entity
    Baseline { epoch: String, version: String },

    /// Show an entity's baselines, oldest epoch first
    Baselines { entity_id: String },

    /// Apply a JSON array of scoring events
    ApplyEvents { file: PathBuf },

    /// Check current scores against the ledgers
    Verify,

    /// Generate a draft snapshot
    Generate { period: String, version: String },

    /// Publish a draft snapshot
    Publish { snapshot_id: String },

    /// Show the current snapshot
    Current,

    /// List all snapshots
    Snapshots,

    /// Show an entity's movement in the current snapshot
    Movement { entity_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    init_logging(&config.log_level);

    let mut engine = RankingEngine::open(config.clone())
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    match cli.command {
        Commands::Init => {
            println!("🗄️  Database ready: {}", config.database_path);
        }

        Commands::AddEntity {
            id,
            name,
            slug,
            category,
            subject,
        } => {
            let slug = slug.unwrap_or_else(|| id.clone());
            let subject = subject.unwrap_or_else(|| id.clone());
            engine.register_entity(&Entity::new(&id, &name, &slug, &category, &subject))?;
            println!("✓ Registered {} ({})", id, name);
        }

        Commands::Redirect { id, canonical } => {
            engine.redirect_entity(&id, &canonical)?;
            println!("✓ {} now redirects to {}", id, canonical);
        }

        Commands::Retire { id } => {
            engine.retire_entity(&id)?;
            println!("✓ Retired {}", id);
        }

        Commands::Entities => {
            for entity in engine.list_entities()? {
                let target = entity
                    .canonical_id
                    .as_deref()
                    .map(|c| format!(" → {}", c))
                    .unwrap_or_default();
                println!(
                    "{:<24} {:<9} {:<24} {}{}",
                    entity.id,
                    entity.status.as_str(),
                    entity.subject,
                    entity.name,
                    target
                );
            }
        }

        Commands::RegisterVersion { file } => {
            let version = AlgorithmVersion::from_file(&file)?;
            engine.register_algorithm_version(&version)?;
            println!("✓ Registered algorithm version {}", version.version);
        }

        Commands::RecordMetrics { epoch, file } => {
            let metrics = if is_csv(&file) {
                load_metrics_csv(&file)?
            } else {
                load_metrics_json(&file)?
            };
            let count = engine.record_metrics(&epoch, &metrics)?;
            println!("✓ Recorded metrics for {} entities at epoch {}", count, epoch);
        }

        Commands::Baseline { epoch, version } => {
            let records = engine.establish_baselines(&epoch, &version)?;
            println!("📒 Baselines at {} (algorithm {})", epoch, version);
            for record in &records {
                println!("   {:<24} {:>6.1}", record.entity_id, record.score);
            }
            println!("✓ {} baselines established", records.len());
        }

        Commands::Baselines { entity_id } => {
            println!("📒 Baselines of {}", entity_id);
            for record in engine.baseline_history(&entity_id)? {
                println!(
                    "   {:<12} {:>6.1}  algorithm {}  ledger seq {}",
                    record.epoch, record.score, record.algorithm_version, record.ledger_seq
                );
            }
        }

        Commands::ApplyEvents { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read events file: {:?}", file))?;
            let submissions: Vec<EventSubmission> =
                serde_json::from_str(&content).context("Failed to parse events JSON")?;

            let (mut applied, mut duplicates) = (0, 0);
            for submission in &submissions {
                match engine.apply_event(submission)? {
                    ApplyOutcome::Applied { .. } => applied += 1,
                    ApplyOutcome::Duplicate { .. } => duplicates += 1,
                }
            }
            println!("✓ {} applied, {} duplicates absorbed", applied, duplicates);
        }

        Commands::Verify => {
            let violations = engine.verify_invariant()?;
            if !violations.is_empty() {
                for violation in &violations {
                    println!("❌ {}", violation);
                }
                bail!("{} invariant violation(s)", violations.len());
            }
            println!("✅ Ledger invariant holds");
        }

        Commands::Generate { period, version } => {
            let snapshot = engine.generate_snapshot(&period, &version)?;
            print_snapshot(&snapshot);
        }

        Commands::Publish { snapshot_id } => {
            let snapshot = engine.publish_snapshot(&snapshot_id)?;
            println!("🎉 Published {} ({})", snapshot.id, snapshot.period);
        }

        Commands::Current => {
            let snapshot = engine.get_current_snapshot()?;
            print_snapshot(&snapshot);
        }

        Commands::Snapshots => {
            for summary in engine.list_snapshots()? {
                println!(
                    "{}  {:<12} {:<8} {:<10} {} entries",
                    summary.id,
                    summary.period,
                    summary.algorithm_version,
                    summary.status.as_str(),
                    summary.entry_count
                );
            }
        }

        Commands::Movement { entity_id } => {
            let movement = engine.get_movement(&entity_id)?;
            println!("{}", serde_json::to_string_pretty(&movement)?);
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

fn print_snapshot(snapshot: &RankingSnapshot) {
    println!(
        "📸 Snapshot {} ({}, algorithm {}, {})",
        snapshot.id,
        snapshot.period,
        snapshot.algorithm_version,
        snapshot.status.as_str()
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for entry in &snapshot.entries {
        let change = match entry.movement.change {
            Some(c) if c > 0 => format!("▲{}", c),
            Some(c) if c < 0 => format!("▼{}", -c),
            Some(_) => "=".to_string(),
            None => "new".to_string(),
        };
        let reason = entry
            .movement
            .primary_factor
            .as_deref()
            .map(|f| format!("  ({})", f))
            .unwrap_or_default();
        println!(
            "{:>4}  {:<2} {:<24} {:>7.2}  {}{}",
            entry.rank, entry.tier, entry.name, entry.score, change, reason
        );
    }
    for dropped in &snapshot.dropped {
        println!("   ✗ {} (was #{})", dropped.entity_id, dropped.previous_position);
    }
}
