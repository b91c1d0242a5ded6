use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::team_features::{Metric, MetricGroup, TeamFeatures};
use crate::zscore::ZScoreTable;

/// Per-metric weights for each index. Metrics without a weight contribute nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexWeights {
    pub offense: BTreeMap<Metric, f64>,
    pub defense: BTreeMap<Metric, f64>,
    pub talent: BTreeMap<Metric, f64>,
}

impl Default for IndexWeights {
    fn default() -> Self {
        Self {
            offense: BTreeMap::from([
                (Metric::OffYardsPerPlay, 0.30),
                (Metric::OffPassYardsPerAttempt, 0.15),
                (Metric::OffRushYardsPerCarry, 0.10),
                (Metric::OffSuccessRate, 0.20),
                (Metric::OffEpaPerPlay, 0.25),
                (Metric::Pace, 0.05),
            ]),
            defense: BTreeMap::from([
                (Metric::DefYardsPerPlay, 0.30),
                (Metric::DefPassYardsPerAttempt, 0.15),
                (Metric::DefRushYardsPerCarry, 0.10),
                (Metric::DefSuccessRate, 0.20),
                (Metric::DefEpaPerPlay, 0.25),
            ]),
            talent: BTreeMap::from([
                (Metric::TalentComposite, 0.20),
                (Metric::BlueChipPct, 0.10),
                (Metric::CommitSignal, 0.05),
            ]),
        }
    }
}

impl IndexWeights {
    pub fn for_group(&self, group: MetricGroup) -> &BTreeMap<Metric, f64> {
        match group {
            MetricGroup::Offense => &self.offense,
            MetricGroup::Defense => &self.defense,
            MetricGroup::Talent => &self.talent,
        }
    }
}

fn weighted_sum(features: &TeamFeatures, stats: &ZScoreTable, weights: &BTreeMap<Metric, f64>) -> f64 {
    weights
        .iter()
        .map(|(metric, w)| w * stats.z(features, *metric))
        .filter(|v| v.is_finite())
        .sum()
}

pub fn offensive_index(features: &TeamFeatures, stats: &ZScoreTable, weights: &IndexWeights) -> f64 {
    weighted_sum(features, stats, &weights.offense)
}

/// Defensive metrics measure what a team allows, so the sum is negated: positive means stingy.
pub fn defensive_index(features: &TeamFeatures, stats: &ZScoreTable, weights: &IndexWeights) -> f64 {
    let v = -weighted_sum(features, stats, &weights.defense);
    if v == 0.0 { 0.0 } else { v }
}

pub fn talent_component(features: &TeamFeatures, talent_stats: &ZScoreTable, weights: &IndexWeights) -> f64 {
    weighted_sum(features, talent_stats, &weights.talent)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComposedRating {
    pub offense: f64,
    pub defense: f64,
    pub talent: f64,
}

impl ComposedRating {
    pub fn power(&self) -> f64 {
        self.offense + self.defense + self.talent
    }
}

/// Offense + defense + talent. A team with no performance metrics at all
/// carries only its talent term.
pub fn compose(
    features: &TeamFeatures,
    stats: &ZScoreTable,
    talent_stats: &ZScoreTable,
    weights: &IndexWeights,
) -> ComposedRating {
    let talent = talent_component(features, talent_stats, weights);
    if !features.has_core_features() {
        return ComposedRating {
            offense: 0.0,
            defense: 0.0,
            talent,
        };
    }
    ComposedRating {
        offense: offensive_index(features, stats, weights),
        defense: defensive_index(features, stats, weights),
        talent,
    }
}
