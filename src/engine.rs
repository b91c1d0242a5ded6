//! One rating run: load, adjust for schedule, shrink, calibrate, persist, verify.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, anyhow};
use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::calibration::calibrate;
use crate::config::{ModelConfig, check_roster_coverage, validate_season};
use crate::error::EngineError;
use crate::feature_loader::{FeatureLoader, SourceSummary, summarize_sources};
use crate::feature_store::{FeatureStore, RatingPrior};
use crate::games::{GameRecord, dedup_games, opponents_by_team};
use crate::rating_store::{RatingStore, RunStatus, TeamRating};
use crate::sanity_gates::{GateReport, run_gates};
use crate::shrinkage::shrink;
use crate::sos::{OpponentStrengthIterator, SosState, powers};
use crate::srs::{self, SrsParams};
use crate::stage_stats::{InstrumentationLog, stage};
use crate::team_features::{MetricGroup, TeamFeatures, TeamId};
use crate::zscore::ZScoreTable;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub season: i32,
    pub model_version: String,
    pub sources: SourceSummary,
    pub sos_state: SosState,
    /// Ratings as computed, ordered by team id.
    pub ratings: Vec<TeamRating>,
    pub upsert_failures: usize,
    pub gates: GateReport,
    pub stages: InstrumentationLog,
}

impl RunReport {
    /// Highest power first.
    pub fn ranked(&self) -> Vec<&TeamRating> {
        let mut out: Vec<&TeamRating> = self.ratings.iter().collect();
        out.sort_by(|a, b| {
            b.power_rating
                .partial_cmp(&a.power_rating)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.team_id.cmp(&b.team_id))
        });
        out
    }

    /// Err when more upserts failed than the caller tolerates.
    pub fn check_upsert_failures(&self, tolerated: usize) -> Result<()> {
        if self.upsert_failures > tolerated {
            return Err(anyhow!(
                "{} rating upserts failed (tolerated: {tolerated})",
                self.upsert_failures
            ));
        }
        Ok(())
    }
}

/// Season schedule for the roster. A team whose lookup fails contributes no games.
pub fn load_games(store: &dyn FeatureStore, roster: &BTreeSet<TeamId>, season: i32) -> Vec<GameRecord> {
    let ids: Vec<TeamId> = roster.iter().copied().collect();
    let per_team: Vec<Vec<GameRecord>> = ids
        .par_iter()
        .map(|id| match store.games_for_team(*id, season) {
            Ok(games) => games,
            Err(err) => {
                warn!(team_id = *id, season, error = %format!("{err:#}"), "games lookup failed; team keeps raw features");
                Vec::new()
            }
        })
        .collect();
    dedup_games(per_team.iter())
}

/// Execute a full run and persist its ratings.
///
/// Configuration and roster problems abort before anything is written. Once
/// the run is in the ledger every outcome is recorded there, including a
/// sanity-gate failure after rows were already upserted.
pub fn run_season(
    season: i32,
    config: &ModelConfig,
    features: &dyn FeatureStore,
    ratings: &mut dyn RatingStore,
) -> Result<RunReport, EngineError> {
    validate_season(season)?;
    config.validate()?;

    let roster = features.roster(season)?;
    check_roster_coverage(roster.len(), &config.roster)?;
    info!(season, model_version = %config.version, teams = roster.len(), "rating run started");

    let run_id = ratings.begin_run(season, &config.version)?;
    match execute(run_id, season, config, features, ratings, &roster) {
        Ok(report) if report.gates.passed() => {
            ratings.finish_run(run_id, RunStatus::Succeeded, None, report.upsert_failures)?;
            info!(
                run_id,
                teams = report.ratings.len(),
                upsert_failures = report.upsert_failures,
                "rating run succeeded"
            );
            Ok(report)
        }
        Ok(report) => {
            let reason = report.gates.to_string();
            ratings.finish_run(run_id, RunStatus::Failed, Some(&reason), report.upsert_failures)?;
            error!(run_id, %reason, "rating run failed sanity gates");
            Err(EngineError::SanityGate {
                run_id,
                report: report.gates,
            })
        }
        Err(err) => {
            let reason = format!("{err:#}");
            if let Err(ledger_err) = ratings.finish_run(run_id, RunStatus::Failed, Some(&reason), 0) {
                warn!(run_id, error = %format!("{ledger_err:#}"), "could not mark run failed");
            }
            Err(EngineError::Store(err))
        }
    }
}

fn execute(
    run_id: i64,
    season: i32,
    config: &ModelConfig,
    features: &dyn FeatureStore,
    ratings: &mut dyn RatingStore,
    roster: &BTreeSet<TeamId>,
) -> Result<RunReport> {
    let loader = FeatureLoader::standard(config.loader);
    let raw = loader.load_all(features, roster, season);
    let sources = summarize_sources(&raw);
    for f in raw.iter().filter(|f| f.load_failed) {
        warn!(team_id = f.team_id, "team loaded as missing after store error");
    }

    let games = load_games(features, roster, season);
    let opponents = opponents_by_team(&games);
    info!(games = games.len(), "schedule loaded");

    // Talent is season-level; its normalization is shared by every iteration.
    let talent_stats = ZScoreTable::compute(&raw, &[MetricGroup::Talent]);

    let mut log = InstrumentationLog::new();
    let outcome = OpponentStrengthIterator::new(&raw, &opponents, &talent_stats, &config.weights, config.sos).run(&mut log);
    info!(state = ?outcome.state, passes = outcome.passes(), "opponent adjustment finished");
    log.record(stage::PRE_SHRINKAGE, &powers(&outcome.ratings));

    let priors = load_priors(features, &raw, season);
    let shrunk: Vec<TeamRating> = raw
        .iter()
        .map(|f| {
            let composed = outcome.ratings.get(&f.team_id).copied().unwrap_or_default();
            let prior = priors.get(&f.team_id).copied().unwrap_or(RatingPrior {
                offense: 0.0,
                defense: 0.0,
            });
            let lambda = config.shrinkage.factor(f.confidence, f.games_count);
            // Without performance features the rating is the talent component alone.
            let (offense, defense) = if f.has_core_features() {
                (
                    shrink(composed.offense, prior.offense, lambda),
                    shrink(composed.defense, prior.defense, lambda),
                )
            } else {
                (0.0, 0.0)
            };
            TeamRating {
                team_id: f.team_id,
                offense_rating: offense,
                defense_rating: defense,
                power_rating: offense + defense + composed.talent,
                confidence: f.confidence,
                data_source: f.data_source,
                shrinkage_factor: lambda,
            }
        })
        .collect();
    log.record(stage::POST_SHRINKAGE, &shrunk.iter().map(|r| r.power_rating).collect::<Vec<_>>());

    let factor = config.calibration_factor;
    let calibrated: Vec<TeamRating> = shrunk
        .into_iter()
        .map(|r| TeamRating {
            offense_rating: calibrate(r.offense_rating, factor),
            defense_rating: calibrate(r.defense_rating, factor),
            power_rating: calibrate(r.power_rating, factor),
            ..r
        })
        .collect();
    log.record(stage::POST_CALIBRATION, &calibrated.iter().map(|r| r.power_rating).collect::<Vec<_>>());

    let mut upsert_failures = 0usize;
    let mut written: Vec<(TeamId, f64)> = Vec::with_capacity(calibrated.len());
    for rating in &calibrated {
        match ratings.upsert(season, &config.version, rating) {
            Ok(()) => written.push((rating.team_id, rating.power_rating)),
            Err(err) => {
                upsert_failures += 1;
                warn!(team_id = rating.team_id, error = %format!("{err:#}"), "rating upsert failed");
            }
        }
    }
    if upsert_failures > 0 {
        warn!(upsert_failures, attempted = calibrated.len(), "some ratings were not persisted");
    }

    let readback: Vec<(TeamId, f64)> = ratings
        .read_back(season, &config.version)?
        .into_iter()
        .filter(|r| roster.contains(&r.team_id))
        .map(|r| (r.team_id, r.power_rating))
        .collect();
    log.record(stage::READBACK, &readback.iter().map(|(_, p)| *p).collect::<Vec<_>>());

    if let Err(err) = ratings.record_stage_stats(run_id, &log) {
        warn!(run_id, error = %format!("{err:#}"), "could not persist stage stats");
    }

    let gates = run_gates(&written, &readback, &config.gates);

    Ok(RunReport {
        run_id,
        season,
        model_version: config.version.clone(),
        sources,
        sos_state: outcome.state,
        ratings: calibrated,
        upsert_failures,
        gates,
        stages: log,
    })
}

fn load_priors(store: &dyn FeatureStore, features: &[TeamFeatures], season: i32) -> BTreeMap<TeamId, RatingPrior> {
    features
        .par_iter()
        .filter_map(|f| match store.prior_rating(f.team_id, season) {
            Ok(prior) => prior.map(|p| (f.team_id, p)),
            Err(err) => {
                warn!(team_id = f.team_id, error = %format!("{err:#}"), "prior lookup failed; shrinking toward league average");
                None
            }
        })
        .collect()
}

/// Margin-based SRS over the roster's completed games.
pub fn run_srs(store: &dyn FeatureStore, season: i32, params: &SrsParams) -> Result<BTreeMap<TeamId, f64>, EngineError> {
    validate_season(season)?;
    let roster = store.roster(season)?;
    let games = load_games(store, &roster, season);
    let ratings = srs::solve(&games, params);
    info!(season, teams = ratings.len(), games = games.len(), "srs solved");
    Ok(ratings)
}
