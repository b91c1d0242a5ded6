use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cfb_ratings::audit_export;
use cfb_ratings::calibration::implied_spread;
use cfb_ratings::config::{ConfigOverrides, DEFAULT_MODEL_VERSION, ModelRegistry};
use cfb_ratings::engine::{self, RunReport};
use cfb_ratings::feature_store::{self, SqliteFeatureStore};
use cfb_ratings::rating_store::{RatingStore, SqliteRatingStore};
use cfb_ratings::srs::SrsParams;
use cfb_ratings::synthetic::{self, SyntheticParams};

const DEFAULT_DB: &str = "cfb_ratings.sqlite";

/// College football power ratings with opponent adjustment and a margin-based SRS
#[derive(Parser)]
#[command(name = "cfb_ratings")]
#[command(about = "Opponent-adjusted college football power ratings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute, persist and verify power ratings for a season
    Rate {
        #[arg(long)]
        season: i32,
        #[arg(long, default_value = DEFAULT_MODEL_VERSION)]
        model_version: String,
        #[arg(long)]
        sos_weight: Option<f64>,
        #[arg(long)]
        shrinkage_base: Option<f64>,
        #[arg(long)]
        calibration_factor: Option<f64>,
        /// Expected roster size for the coverage check
        #[arg(long)]
        expected_teams: Option<usize>,
        /// Upsert failures tolerated before the command reports failure
        #[arg(long, default_value = "0")]
        max_upsert_failures: usize,
        /// TOML model configuration (falls back to CFB_RATINGS_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Write ratings and stage stats after a successful run (.xlsx or .csv)
        #[arg(long)]
        export: Option<PathBuf>,
        /// Rows to print
        #[arg(long, default_value = "25")]
        top: usize,
    },
    /// Print margin-based SRS ratings
    Srs {
        #[arg(long)]
        season: i32,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Load a JSON season bundle into the feature tables
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Write a seeded synthetic season into the feature tables
    Synth {
        #[arg(long)]
        season: i32,
        #[arg(long, default_value = "40")]
        teams: usize,
        #[arg(long, default_value = "12")]
        weeks: u32,
        #[arg(long, default_value = "7")]
        seed: u64,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Export stored ratings and the latest run's stage stats
    Export {
        #[arg(long)]
        season: i32,
        #[arg(long, default_value = DEFAULT_MODEL_VERSION)]
        model_version: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Implied home-minus-away spread from stored ratings
    Spread {
        #[arg(long)]
        season: i32,
        #[arg(long, default_value = DEFAULT_MODEL_VERSION)]
        model_version: String,
        #[arg(long)]
        home: u32,
        #[arg(long)]
        away: u32,
        #[arg(long)]
        neutral: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn db_path(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| std::env::var_os("CFB_RATINGS_DB").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB))
}

fn registry(arg: Option<PathBuf>) -> Result<ModelRegistry> {
    match arg.or_else(|| std::env::var_os("CFB_RATINGS_CONFIG").map(PathBuf::from)) {
        Some(path) => Ok(ModelRegistry::from_file(&path)?),
        None => Ok(ModelRegistry::builtin()),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Rate {
            season,
            model_version,
            sos_weight,
            shrinkage_base,
            calibration_factor,
            expected_teams,
            max_upsert_failures,
            config,
            db,
            export,
            top,
        } => {
            let mut model = registry(config)?.resolve(&model_version)?;
            model.apply(&ConfigOverrides {
                sos_weight,
                shrinkage_base,
                calibration_factor,
                expected_roster_size: expected_teams,
            })?;
            let path = db_path(db);
            let features = SqliteFeatureStore::open(&path)?;
            let mut ratings = SqliteRatingStore::open(&path)?;
            let report = engine::run_season(season, &model, &features, &mut ratings)?;
            print_report(&report, top);
            if let Some(out) = export {
                let run = ratings.run(report.run_id)?;
                let summary =
                    audit_export::export_audit(&out, &report.ratings, report.stages.entries(), run.as_ref())?;
                print_export(&summary);
            }
            report.check_upsert_failures(max_upsert_failures)?;
        }
        Commands::Srs { season, iterations, db } => {
            let mut params = SrsParams::default();
            if let Some(n) = iterations {
                params.iterations = n;
            }
            let features = SqliteFeatureStore::open(&db_path(db))?;
            let ratings = engine::run_srs(&features, season, &params)?;
            let mut ranked: Vec<(u32, f64)> = ratings.into_iter().collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            println!("SRS {season} ({} teams)", ranked.len());
            for (idx, (team_id, rating)) in ranked.iter().enumerate() {
                println!("{:>4} team {:>5} {:>8.2}", idx + 1, team_id, rating);
            }
        }
        Commands::Import { file, db } => {
            let bundle = feature_store::read_bundle(&file)?;
            let store = SqliteFeatureStore::open(&db_path(db))?;
            let summary = store.import_bundle(&bundle)?;
            println!("Import complete");
            println!("Season: {}", summary.season);
            println!("Teams: {}", summary.teams);
            println!("Team game rows: {}", summary.game_stats);
            println!("Games: {}", summary.games);
        }
        Commands::Synth {
            season,
            teams,
            weeks,
            seed,
            db,
        } => {
            let generated = synthetic::generate(season, &SyntheticParams { teams, weeks, seed });
            let store = SqliteFeatureStore::open(&db_path(db))?;
            let summary = store.import_bundle(&generated.bundle)?;
            println!(
                "Synthetic season {} written: {} teams, {} games, {} team game rows (seed {seed})",
                summary.season, summary.teams, summary.games, summary.game_stats
            );
        }
        Commands::Export {
            season,
            model_version,
            out,
            db,
        } => {
            let ratings = SqliteRatingStore::open(&db_path(db))?;
            let stored = ratings.read_back(season, &model_version)?;
            if stored.is_empty() {
                return Err(anyhow!("no stored ratings for {season} / {model_version}"));
            }
            let run = ratings.latest_run(season, &model_version)?;
            let stages = match &run {
                Some(r) => ratings.stage_stats(r.run_id)?,
                None => Vec::new(),
            };
            let summary = audit_export::export_audit(&out, &stored, &stages, run.as_ref())?;
            print_export(&summary);
        }
        Commands::Spread {
            season,
            model_version,
            home,
            away,
            neutral,
            config,
            db,
        } => {
            let model = registry(config)?.resolve(&model_version)?;
            let ratings = SqliteRatingStore::open(&db_path(db))?;
            let stored = ratings.read_back(season, &model_version)?;
            let power = |team: u32| {
                stored
                    .iter()
                    .find(|r| r.team_id == team)
                    .map(|r| r.power_rating)
                    .with_context(|| format!("no stored rating for team {team}"))
            };
            let spread = implied_spread(power(home)?, power(away)?, model.home_field_advantage, neutral);
            println!("team {home} vs team {away}: {spread:+.1}");
        }
    }
    Ok(())
}

fn print_report(report: &RunReport, top: usize) {
    println!(
        "Run {} succeeded: season {} model {} ({} teams, SoS {:?})",
        report.run_id,
        report.season,
        report.model_version,
        report.ratings.len(),
        report.sos_state
    );
    println!(
        "Power stddev {:.3}, zero share {:.2}%, upsert failures {}",
        report.gates.stddev,
        report.gates.zero_fraction * 100.0,
        report.upsert_failures
    );
    println!(
        "{:>4} {:>6} {:>8} {:>8} {:>8} {:>5} {:<17}",
        "rank", "team", "power", "off", "def", "conf", "source"
    );
    for (idx, r) in report.ranked().into_iter().take(top).enumerate() {
        println!(
            "{:>4} {:>6} {:>8.2} {:>8.2} {:>8.2} {:>5.2} {:<17}",
            idx + 1,
            r.team_id,
            r.power_rating,
            r.offense_rating,
            r.defense_rating,
            r.confidence,
            r.data_source.as_str()
        );
    }
}

fn print_export(summary: &audit_export::ExportReport) {
    let files: Vec<String> = summary.files.iter().map(|p| display(p)).collect();
    println!(
        "Exported {} ratings and {} stage rows to {}",
        summary.ratings,
        summary.stages,
        files.join(", ")
    );
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
