use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::feature_store::FeatureStore;
use crate::team_features::{DataSource, Metric, MetricGroup, PerformanceMetrics, TeamFeatures, TeamId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoaderParams {
    /// Game-level stats are trusted only with at least this many games.
    pub min_game_level_games: u32,
    /// Games at which the games term of confidence saturates.
    pub full_confidence_games: u32,
}

impl Default for LoaderParams {
    fn default() -> Self {
        Self {
            min_game_level_games: 3,
            full_confidence_games: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierResult {
    pub performance: PerformanceMetrics,
    pub games_count: u32,
}

/// One rung of the fallback ladder. `Ok(None)` means "nothing here, try the next tier".
pub trait FallbackProvider: Send + Sync {
    fn source(&self) -> DataSource;
    fn provide(&self, store: &dyn FeatureStore, team_id: TeamId, season: i32) -> Result<Option<TierResult>>;
}

pub struct GameLevelProvider {
    pub min_games: u32,
}

impl FallbackProvider for GameLevelProvider {
    fn source(&self) -> DataSource {
        DataSource::GameLevel
    }

    fn provide(&self, store: &dyn FeatureStore, team_id: TeamId, season: i32) -> Result<Option<TierResult>> {
        let rows = store.team_game_stats(team_id, season)?;
        if rows.is_empty() || (rows.len() as u32) < self.min_games {
            return Ok(None);
        }
        let performance = aggregate_game_metrics(rows.iter().map(|r| &r.metrics));
        if performance.is_empty() {
            return Ok(None);
        }
        Ok(Some(TierResult {
            performance,
            games_count: rows.len() as u32,
        }))
    }
}

pub struct SeasonAggregateProvider;

impl FallbackProvider for SeasonAggregateProvider {
    fn source(&self) -> DataSource {
        DataSource::SeasonAggregate
    }

    fn provide(&self, store: &dyn FeatureStore, team_id: TeamId, season: i32) -> Result<Option<TierResult>> {
        Ok(store
            .season_aggregate(team_id, season)?
            .filter(|agg| !agg.metrics.is_empty())
            .map(|agg| TierResult {
                performance: agg.metrics,
                games_count: agg.games_count,
            }))
    }
}

pub struct BaselineProvider;

impl FallbackProvider for BaselineProvider {
    fn source(&self) -> DataSource {
        DataSource::Baseline
    }

    fn provide(&self, store: &dyn FeatureStore, team_id: TeamId, season: i32) -> Result<Option<TierResult>> {
        Ok(store
            .preseason_baseline(team_id, season)?
            .filter(|m| !m.is_empty())
            .map(|performance| TierResult {
                performance,
                games_count: 0,
            }))
    }
}

/// Per-metric mean over the games that reported it.
pub fn aggregate_game_metrics<'a>(rows: impl Iterator<Item = &'a PerformanceMetrics>) -> PerformanceMetrics {
    let perf_metrics: Vec<Metric> = Metric::ALL
        .into_iter()
        .filter(|m| m.group() != MetricGroup::Talent)
        .collect();
    let mut sums: BTreeMap<Metric, (f64, usize)> = BTreeMap::new();
    for row in rows {
        for m in &perf_metrics {
            if let Some(v) = row.get(*m).filter(|v| v.is_finite()) {
                let e = sums.entry(*m).or_insert((0.0, 0));
                e.0 += v;
                e.1 += 1;
            }
        }
    }
    let mut out = PerformanceMetrics::default();
    for (m, (sum, n)) in sums {
        if n > 0 {
            out.set(m, Some(sum / n as f64));
        }
    }
    out
}

/// Tier ceiling scaled by how much of a season the sample covers, clipped to `[0, 1]`.
pub fn confidence(source: DataSource, games: u32, params: &LoaderParams) -> f64 {
    let ceiling = match source {
        DataSource::GameLevel => 1.0,
        DataSource::SeasonAggregate => 0.8,
        DataSource::Baseline => 0.35,
        DataSource::Missing => return 0.0,
    };
    let full = params.full_confidence_games.max(1) as f64;
    let coverage = (games as f64 / full).clamp(0.0, 1.0);
    (ceiling * (0.5 + 0.5 * coverage)).clamp(0.0, 1.0)
}

pub struct FeatureLoader {
    providers: Vec<Box<dyn FallbackProvider>>,
    params: LoaderParams,
}

impl FeatureLoader {
    /// Game-level, then season aggregate, then preseason baseline.
    pub fn standard(params: LoaderParams) -> Self {
        Self {
            providers: vec![
                Box::new(GameLevelProvider {
                    min_games: params.min_game_level_games,
                }),
                Box::new(SeasonAggregateProvider),
                Box::new(BaselineProvider),
            ],
            params,
        }
    }

    pub fn with_providers(providers: Vec<Box<dyn FallbackProvider>>, params: LoaderParams) -> Self {
        Self { providers, params }
    }

    /// Never fails. A store error on the performance ladder leaves the team on
    /// `Missing` with `load_failed` set; talent is read separately either way.
    pub fn load(&self, store: &dyn FeatureStore, team_id: TeamId, season: i32) -> TeamFeatures {
        let mut out = TeamFeatures::missing(team_id, season);
        match self.performance_tier(store, team_id, season) {
            Ok(Some((source, tier))) => {
                out.performance = tier.performance;
                out.games_count = tier.games_count;
                out.data_source = source;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(team_id, season, error = %format!("{err:#}"), "performance load failed; treating team as missing");
                out.load_failed = true;
            }
        }
        match store.talent(team_id, season) {
            Ok(talent) => out.talent = talent.unwrap_or_default(),
            Err(err) => {
                warn!(team_id, season, error = %format!("{err:#}"), "talent load failed");
                out.load_failed = true;
            }
        }
        out.confidence = confidence(out.data_source, out.games_count, &self.params);
        out.last_updated = Utc::now();
        out
    }

    fn performance_tier(
        &self,
        store: &dyn FeatureStore,
        team_id: TeamId,
        season: i32,
    ) -> Result<Option<(DataSource, TierResult)>> {
        for provider in &self.providers {
            if let Some(tier) = provider.provide(store, team_id, season)? {
                return Ok(Some((provider.source(), tier)));
            }
        }
        Ok(None)
    }

    /// Fan out over the roster; result is ordered by team id.
    pub fn load_all(&self, store: &dyn FeatureStore, roster: &BTreeSet<TeamId>, season: i32) -> Vec<TeamFeatures> {
        let ids: Vec<TeamId> = roster.iter().copied().collect();
        ids.par_iter().map(|id| self.load(store, *id, season)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSummary {
    pub total: usize,
    pub by_source: BTreeMap<DataSource, usize>,
    pub failed: usize,
    pub mean_confidence: f64,
}

impl SourceSummary {
    pub fn count(&self, source: DataSource) -> usize {
        self.by_source.get(&source).copied().unwrap_or(0)
    }
}

pub fn summarize_sources(features: &[TeamFeatures]) -> SourceSummary {
    let mut by_source: BTreeMap<DataSource, usize> = DataSource::ALL.iter().map(|s| (*s, 0)).collect();
    for f in features {
        *by_source.entry(f.data_source).or_insert(0) += 1;
    }
    let failed = features.iter().filter(|f| f.load_failed).count();
    let mean_confidence = if features.is_empty() {
        0.0
    } else {
        features.iter().map(|f| f.confidence).sum::<f64>() / features.len() as f64
    };
    let summary = SourceSummary {
        total: features.len(),
        by_source,
        failed,
        mean_confidence,
    };
    info!(
        total = summary.total,
        game_level = summary.count(DataSource::GameLevel),
        season_aggregate = summary.count(DataSource::SeasonAggregate),
        baseline = summary.count(DataSource::Baseline),
        missing = summary.count(DataSource::Missing),
        failed = summary.failed,
        mean_confidence = summary.mean_confidence,
        "feature sources"
    );
    summary
}
