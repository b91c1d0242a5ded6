//! Opponent-strength (strength of schedule) iteration.
//!
//! Iteration 0 rates teams from raw features. Every later iteration rescales
//! each team's raw offensive metrics by the defensive strength of the
//! opponents it faced (and defensive metrics by their offensive strength),
//! using the previous iteration's ratings, then re-normalizes and
//! re-composes. Each iteration reads a frozen snapshot and builds a new
//! rating map.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::index_composer::{self, ComposedRating, IndexWeights};
use crate::stage_stats::{InstrumentationLog, stage};
use crate::team_features::{MetricGroup, TeamFeatures, TeamId};
use crate::zscore::ZScoreTable;

/// League-average rating every opponent delta is measured against.
const LEAGUE_AVERAGE_RATING: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SosParams {
    pub enabled: bool,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub weight: f64,
}

impl Default for SosParams {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
            convergence_threshold: 0.01,
            weight: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SosState {
    Initial,
    /// `k` adjustment iterations completed so far (0 = raw ratings only).
    Adjusting(usize),
    Converged { iterations: usize, max_delta: f64 },
    IterationCapReached { iterations: usize, max_delta: f64 },
    Disabled,
}

impl SosState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SosState::Converged { .. } | SosState::IterationCapReached { .. } | SosState::Disabled
        )
    }
}

pub type RatingVector = BTreeMap<TeamId, ComposedRating>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentFactors {
    pub offense: f64,
    pub defense: f64,
}

impl AdjustmentFactors {
    pub const NEUTRAL: AdjustmentFactors = AdjustmentFactors {
        offense: 1.0,
        defense: 1.0,
    };
}

/// Factors for one team from its completed-game opponents and the previous
/// iteration's ratings. Opponents without a rating are left out of the
/// average; no rated opponent means no change.
pub fn adjustment_factors(opponents: &[TeamId], previous: &RatingVector, weight: f64) -> AdjustmentFactors {
    if opponents.is_empty() {
        return AdjustmentFactors::NEUTRAL;
    }
    let faced: Vec<&ComposedRating> = opponents.iter().filter_map(|o| previous.get(o)).collect();
    if faced.is_empty() {
        return AdjustmentFactors::NEUTRAL;
    }
    let n = faced.len() as f64;
    let avg_def = faced.iter().map(|r| r.defense).sum::<f64>() / n;
    let avg_off = faced.iter().map(|r| r.offense).sum::<f64>() / n;
    AdjustmentFactors {
        offense: 1.0 + (LEAGUE_AVERAGE_RATING - avg_def) * weight,
        defense: 1.0 + (LEAGUE_AVERAGE_RATING - avg_off) * weight,
    }
}

pub fn adjust_features(features: &TeamFeatures, factors: AdjustmentFactors) -> TeamFeatures {
    features
        .scaled_copy(MetricGroup::Offense, factors.offense)
        .scaled_copy(MetricGroup::Defense, factors.defense)
}

/// Normalize `features` against themselves and compose a rating per team.
pub fn rate_features(features: &[TeamFeatures], talent_stats: &ZScoreTable, weights: &IndexWeights) -> RatingVector {
    let stats = ZScoreTable::compute(features, &[MetricGroup::Offense, MetricGroup::Defense]);
    features
        .par_iter()
        .map(|f| (f.team_id, index_composer::compose(f, &stats, talent_stats, weights)))
        .collect()
}

pub fn max_power_delta(previous: &RatingVector, current: &RatingVector) -> f64 {
    current
        .iter()
        .map(|(id, r)| {
            let before = previous.get(id).map(|p| p.power()).unwrap_or(0.0);
            (r.power() - before).abs()
        })
        .fold(0.0, f64::max)
}

pub struct OpponentStrengthIterator<'a> {
    raw: &'a [TeamFeatures],
    opponents: &'a BTreeMap<TeamId, Vec<TeamId>>,
    talent_stats: &'a ZScoreTable,
    weights: &'a IndexWeights,
    params: SosParams,
    state: SosState,
    ratings: RatingVector,
    adjusted: Vec<TeamFeatures>,
    deltas: Vec<f64>,
}

impl<'a> OpponentStrengthIterator<'a> {
    pub fn new(
        raw: &'a [TeamFeatures],
        opponents: &'a BTreeMap<TeamId, Vec<TeamId>>,
        talent_stats: &'a ZScoreTable,
        weights: &'a IndexWeights,
        params: SosParams,
    ) -> Self {
        Self {
            raw,
            opponents,
            talent_stats,
            weights,
            params,
            state: SosState::Initial,
            ratings: RatingVector::new(),
            adjusted: raw.to_vec(),
            deltas: Vec::new(),
        }
    }

    pub fn state(&self) -> SosState {
        self.state
    }

    pub fn ratings(&self) -> &RatingVector {
        &self.ratings
    }

    /// Features the latest ratings were computed from.
    pub fn adjusted_features(&self) -> &[TeamFeatures] {
        &self.adjusted
    }

    /// Max power delta observed at each adjustment iteration, in order.
    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    /// Advance one transition. Terminal states are sticky.
    pub fn step(&mut self, log: &mut InstrumentationLog) -> SosState {
        self.state = match self.state {
            SosState::Initial => {
                self.ratings = rate_features(self.raw, self.talent_stats, self.weights);
                log.record(stage::RAW_BASELINE, &powers(&self.ratings));
                if !self.params.enabled || self.params.max_iterations == 0 {
                    info!(enabled = self.params.enabled, "opponent adjustment skipped");
                    SosState::Disabled
                } else {
                    SosState::Adjusting(0)
                }
            }
            SosState::Adjusting(done) => {
                let k = done + 1;
                let previous = &self.ratings;
                let adjusted: Vec<TeamFeatures> = self
                    .raw
                    .par_iter()
                    .map(|f| {
                        let opps = self.opponents.get(&f.team_id).map(Vec::as_slice).unwrap_or(&[]);
                        adjust_features(f, adjustment_factors(opps, previous, self.params.weight))
                    })
                    .collect();
                let current = rate_features(&adjusted, self.talent_stats, self.weights);
                let delta = max_power_delta(previous, &current);
                debug!(iteration = k, max_delta = delta, "opponent adjustment iteration");
                log.record(stage::sos_iteration(k), &powers(&current));

                self.ratings = current;
                self.adjusted = adjusted;
                self.deltas.push(delta);

                if delta < self.params.convergence_threshold {
                    info!(iterations = k, max_delta = delta, "opponent adjustment converged");
                    SosState::Converged {
                        iterations: k,
                        max_delta: delta,
                    }
                } else if k >= self.params.max_iterations {
                    warn!(
                        iterations = k,
                        max_delta = delta,
                        threshold = self.params.convergence_threshold,
                        "opponent adjustment hit iteration cap without converging; keeping last iteration"
                    );
                    SosState::IterationCapReached {
                        iterations: k,
                        max_delta: delta,
                    }
                } else {
                    SosState::Adjusting(k)
                }
            }
            terminal => terminal,
        };
        self.state
    }

    pub fn run(mut self, log: &mut InstrumentationLog) -> SosOutcome {
        while !self.state.is_terminal() {
            self.step(log);
        }
        SosOutcome {
            state: self.state,
            ratings: self.ratings,
            adjusted: self.adjusted,
            deltas: self.deltas,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SosOutcome {
    pub state: SosState,
    pub ratings: RatingVector,
    pub adjusted: Vec<TeamFeatures>,
    pub deltas: Vec<f64>,
}

impl SosOutcome {
    /// Rating computations performed, counting the raw pass.
    pub fn passes(&self) -> usize {
        self.deltas.len() + 1
    }
}

pub fn powers(ratings: &RatingVector) -> Vec<f64> {
    ratings.values().map(ComposedRating::power).collect()
}
