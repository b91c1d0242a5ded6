use anyhow::{Result, anyhow};

use cfb_ratings::config::{ConfigOverrides, DEFAULT_MODEL_VERSION, ModelConfig, ModelRegistry};
use cfb_ratings::engine::{self, load_games};
use cfb_ratings::error::EngineError;
use cfb_ratings::feature_loader::{FeatureLoader, LoaderParams};
use cfb_ratings::feature_store::{FeatureStore, RatingPrior, SeasonAggregate, SqliteFeatureStore};
use cfb_ratings::games::opponents_by_team;
use cfb_ratings::index_composer::IndexWeights;
use cfb_ratings::rating_store::{RatingStore, RunStatus, SqliteRatingStore, TeamRating};
use cfb_ratings::sanity_gates::GateFailure;
use cfb_ratings::sos::{OpponentStrengthIterator, SosParams, SosState};
use cfb_ratings::stage_stats::{InstrumentationLog, stage};
use cfb_ratings::synthetic::{self, SyntheticParams};
use cfb_ratings::team_features::{DataSource, MetricGroup, PerformanceMetrics, TalentMetrics, TeamId};
use cfb_ratings::zscore::ZScoreTable;

const SEASON: i32 = 2024;

fn default_config() -> ModelConfig {
    let mut config = ModelRegistry::builtin().resolve(DEFAULT_MODEL_VERSION).unwrap();
    config
        .apply(&ConfigOverrides {
            calibration_factor: Some(7.5),
            ..Default::default()
        })
        .unwrap();
    config
}

fn synthetic_store(teams: usize) -> (SqliteFeatureStore, synthetic::SyntheticSeason) {
    let generated = synthetic::generate(
        SEASON,
        &SyntheticParams {
            teams,
            weeks: 12,
            seed: 21,
        },
    );
    let store = SqliteFeatureStore::open_in_memory().unwrap();
    store.import_bundle(&generated.bundle).unwrap();
    (store, generated)
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let cov: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();
    let vx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
    let vy: f64 = ys.iter().map(|y| (y - my).powi(2)).sum();
    cov / (vx.sqrt() * vy.sqrt())
}

#[test]
fn synthetic_season_passes_gates_and_is_recorded() {
    let (features, generated) = synthetic_store(40);
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let config = default_config();

    let report = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap();
    assert_eq!(report.ratings.len(), 40);
    assert_eq!(report.upsert_failures, 0);
    assert!(report.gates.passed());
    assert_eq!(report.sources.total, 40);
    assert!(report.sources.count(DataSource::Missing) >= 1);
    assert!(matches!(
        report.sos_state,
        SosState::Converged { .. } | SosState::IterationCapReached { .. }
    ));

    let power: Vec<f64> = report.ratings.iter().map(|r| r.power_rating).collect();
    let latent: Vec<f64> = report
        .ratings
        .iter()
        .map(|r| generated.strengths[&r.team_id].total())
        .collect();
    assert!(pearson(&power, &latent) > 0.5);

    let stored = ratings.read_back(SEASON, &config.version).unwrap();
    assert_eq!(stored.len(), 40);
    for (computed, back) in report.ratings.iter().zip(&stored) {
        assert_eq!(computed.team_id, back.team_id);
        assert!((computed.power_rating - back.power_rating).abs() < 1e-9);
    }

    let run = ratings.latest_run(SEASON, &config.version).unwrap().unwrap();
    assert_eq!(run.run_id, report.run_id);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.finished_at.is_some());

    let stages: Vec<String> = ratings
        .stage_stats(report.run_id)
        .unwrap()
        .into_iter()
        .map(|s| s.stage)
        .collect();
    assert_eq!(stages.first().map(String::as_str), Some(stage::RAW_BASELINE));
    assert!(stages.iter().any(|s| s == &stage::sos_iteration(1)));
    let tail: Vec<&str> = stages.iter().rev().take(4).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            stage::PRE_SHRINKAGE,
            stage::POST_SHRINKAGE,
            stage::POST_CALIBRATION,
            stage::READBACK
        ]
    );
}

#[test]
fn calibration_scales_every_component() {
    let (features, _) = synthetic_store(24);
    let base = default_config();
    let mut doubled = base.clone();
    doubled.version = "doubled".into();
    doubled.calibration_factor = base.calibration_factor * 2.0;

    let mut store = SqliteRatingStore::open_in_memory().unwrap();
    let a = engine::run_season(SEASON, &base, &features, &mut store).unwrap();
    let b = engine::run_season(SEASON, &doubled, &features, &mut store).unwrap();
    for (x, y) in a.ratings.iter().zip(&b.ratings) {
        assert!((2.0 * x.power_rating - y.power_rating).abs() < 1e-9);
        assert!((2.0 * x.offense_rating - y.offense_rating).abs() < 1e-9);
        assert_eq!(x.shrinkage_factor, y.shrinkage_factor);
    }
}

#[test]
fn reruns_overwrite_instead_of_duplicating() {
    let (features, _) = synthetic_store(20);
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let config = default_config();
    let first = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap();
    let second = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(ratings.read_back(SEASON, &config.version).unwrap().len(), 20);
    for (a, b) in first.ratings.iter().zip(&second.ratings) {
        assert_eq!(a.power_rating, b.power_rating);
    }
}

/// Rejects the upsert of one team and delegates everything else.
struct RejectingRatingStore {
    inner: SqliteRatingStore,
    rejected: TeamId,
}

impl RatingStore for RejectingRatingStore {
    fn begin_run(&mut self, season: i32, model_version: &str) -> Result<i64> {
        self.inner.begin_run(season, model_version)
    }
    fn upsert(&mut self, season: i32, model_version: &str, rating: &TeamRating) -> Result<()> {
        if rating.team_id == self.rejected {
            return Err(anyhow!("database is locked"));
        }
        self.inner.upsert(season, model_version, rating)
    }
    fn read_back(&self, season: i32, model_version: &str) -> Result<Vec<TeamRating>> {
        self.inner.read_back(season, model_version)
    }
    fn record_stage_stats(&mut self, run_id: i64, log: &InstrumentationLog) -> Result<()> {
        self.inner.record_stage_stats(run_id, log)
    }
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        failure_reason: Option<&str>,
        upsert_failures: usize,
    ) -> Result<()> {
        self.inner
            .finish_run(run_id, status, failure_reason, upsert_failures)
    }
}

#[test]
fn failed_upsert_is_counted_and_the_run_continues() {
    let (features, _) = synthetic_store(24);
    let config = default_config();
    let mut ratings = RejectingRatingStore {
        inner: SqliteRatingStore::open_in_memory().unwrap(),
        rejected: 5,
    };

    let report = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap();
    assert_eq!(report.upsert_failures, 1);
    assert_eq!(report.ratings.len(), 24);
    assert!(report.gates.passed());

    let stored = ratings.read_back(SEASON, &config.version).unwrap();
    assert_eq!(stored.len(), 23);
    assert!(stored.iter().all(|r| r.team_id != 5));

    let run = ratings.inner.run(report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.upsert_failures, 1);

    assert!(report.check_upsert_failures(1).is_ok());
    assert!(report.check_upsert_failures(0).is_err());
}

fn flat_store(teams: u32) -> SqliteFeatureStore {
    let store = SqliteFeatureStore::open_in_memory().unwrap();
    for id in 1..=teams {
        store.add_roster_team(SEASON, id, None).unwrap();
        store
            .upsert_season_aggregate(
                id,
                SEASON,
                &SeasonAggregate {
                    metrics: PerformanceMetrics {
                        off_yards_per_play: Some(5.5),
                        def_yards_per_play: Some(5.5),
                        ..Default::default()
                    },
                    games_count: 10,
                },
            )
            .unwrap();
    }
    store
}

#[test]
fn collapsed_distribution_marks_run_failed_after_writing() {
    let features = flat_store(6);
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let config = default_config();

    let err = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap_err();
    let (run_id, report) = match err {
        EngineError::SanityGate { run_id, report } => (run_id, report),
        other => panic!("expected a sanity gate failure, got {other:?}"),
    };
    assert!(
        report
            .failures
            .iter()
            .any(|f| matches!(f, GateFailure::DistributionCollapse { .. }))
    );
    assert!(
        report
            .failures
            .iter()
            .any(|f| matches!(f, GateFailure::TooManyZeros { .. }))
    );

    // Rows stay written; the ledger carries the verdict.
    assert_eq!(ratings.read_back(SEASON, &config.version).unwrap().len(), 6);
    let run = ratings.run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.unwrap_or_default().contains("stddev"));
}

#[test]
fn coverage_shortfall_aborts_before_the_ledger() {
    let features = flat_store(10);
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let mut config = default_config();
    config.roster.expected_size = Some(100);

    let err = engine::run_season(SEASON, &config, &features, &mut ratings).unwrap_err();
    assert!(matches!(
        err,
        EngineError::RosterCoverage {
            found: 10,
            expected: 100,
            ..
        }
    ));
    assert!(ratings.latest_run(SEASON, &config.version).unwrap().is_none());
}

#[test]
fn season_outside_window_is_rejected() {
    let features = flat_store(3);
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let err = engine::run_season(1987, &default_config(), &features, &mut ratings).unwrap_err();
    assert!(matches!(err, EngineError::InvalidSeason { season: 1987, .. }));
}

/// Seven teams with aggregates, team 8 with talent only.
fn talent_only_store() -> SqliteFeatureStore {
    let store = SqliteFeatureStore::open_in_memory().unwrap();
    for id in 1..=8u32 {
        store.add_roster_team(SEASON, id, None).unwrap();
        store
            .upsert_talent(
                id,
                SEASON,
                &TalentMetrics {
                    talent_composite: Some(500.0 + 25.0 * id as f64),
                    blue_chip_pct: Some(0.1 * id as f64),
                    commit_signal: None,
                },
            )
            .unwrap();
        if id < 8 {
            store
                .upsert_season_aggregate(
                    id,
                    SEASON,
                    &SeasonAggregate {
                        metrics: PerformanceMetrics {
                            off_yards_per_play: Some(4.0 + 0.4 * id as f64),
                            def_yards_per_play: Some(7.0 - 0.3 * id as f64),
                            ..Default::default()
                        },
                        games_count: 12,
                    },
                )
                .unwrap();
        }
    }
    store
}

#[test]
fn team_without_features_keeps_only_its_talent() {
    let store = talent_only_store();
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let config = default_config();
    let report = engine::run_season(SEASON, &config, &store, &mut ratings).unwrap();
    let eight = report.ratings.iter().find(|r| r.team_id == 8).unwrap();
    assert_eq!(eight.data_source, DataSource::Missing);
    assert_eq!(eight.confidence, 0.0);
    assert_eq!(eight.offense_rating, 0.0);
    assert_eq!(eight.defense_rating, 0.0);
    assert!(eight.power_rating > 0.0);
    assert_eq!(eight.shrinkage_factor, config.shrinkage.max);
}

#[test]
fn stored_prior_does_not_leak_into_a_talent_only_rating() {
    let config = default_config();

    let plain = talent_only_store();
    let mut plain_ratings = SqliteRatingStore::open_in_memory().unwrap();
    let baseline = engine::run_season(SEASON, &config, &plain, &mut plain_ratings).unwrap();
    let expected = baseline.ratings.iter().find(|r| r.team_id == 8).unwrap().power_rating;

    let with_prior = talent_only_store();
    with_prior
        .upsert_prior(
            8,
            SEASON,
            &RatingPrior {
                offense: 2.0,
                defense: 1.0,
            },
        )
        .unwrap();
    let mut ratings = SqliteRatingStore::open_in_memory().unwrap();
    let report = engine::run_season(SEASON, &config, &with_prior, &mut ratings).unwrap();
    let eight = report.ratings.iter().find(|r| r.team_id == 8).unwrap();
    assert_eq!(eight.offense_rating, 0.0);
    assert_eq!(eight.defense_rating, 0.0);
    assert!((eight.power_rating - expected).abs() < 1e-12);
}

#[test]
fn sos_stops_at_cap_or_convergence() {
    let (store, _) = synthetic_store(30);
    let roster = store.roster(SEASON).unwrap();
    let raw = FeatureLoader::standard(LoaderParams::default()).load_all(&store, &roster, SEASON);
    let opponents = opponents_by_team(&load_games(&store, &roster, SEASON));
    let talent = ZScoreTable::compute(&raw, &[MetricGroup::Talent]);
    let weights = IndexWeights::default();

    let mut log = InstrumentationLog::new();
    let capped = OpponentStrengthIterator::new(
        &raw,
        &opponents,
        &talent,
        &weights,
        SosParams {
            convergence_threshold: 1e-12,
            ..SosParams::default()
        },
    )
    .run(&mut log);
    assert!(matches!(capped.state, SosState::IterationCapReached { iterations: 3, .. }));
    assert_eq!(capped.passes(), 4);
    assert_eq!(log.entries().len(), 4);

    let mut log = InstrumentationLog::new();
    let still = OpponentStrengthIterator::new(
        &raw,
        &opponents,
        &talent,
        &weights,
        SosParams {
            weight: 0.0,
            ..SosParams::default()
        },
    )
    .run(&mut log);
    assert!(matches!(still.state, SosState::Converged { iterations: 1, .. }));
    assert_eq!(still.deltas, vec![0.0]);

    let mut log = InstrumentationLog::new();
    let off = OpponentStrengthIterator::new(
        &raw,
        &opponents,
        &talent,
        &weights,
        SosParams {
            enabled: false,
            ..SosParams::default()
        },
    )
    .run(&mut log);
    assert_eq!(off.state, SosState::Disabled);
    assert_eq!(off.ratings, still.ratings);
}

#[test]
fn srs_from_the_feature_store_is_zero_centred() {
    let (store, generated) = synthetic_store(30);
    let ratings = engine::run_srs(&store, SEASON, &Default::default()).unwrap();
    assert_eq!(ratings.len(), 30);
    let sum: f64 = ratings.values().sum();
    assert!(sum.abs() < 1e-6);

    let best = generated
        .strengths
        .iter()
        .max_by(|a, b| a.1.total().partial_cmp(&b.1.total()).unwrap())
        .map(|(id, _)| *id)
        .unwrap();
    let worst = generated
        .strengths
        .iter()
        .min_by(|a, b| a.1.total().partial_cmp(&b.1.total()).unwrap())
        .map(|(id, _)| *id)
        .unwrap();
    assert!(ratings[&best] > ratings[&worst]);
}
