//! Margin-based Simple Rating System.
//!
//! Each completed game yields an implied point margin built from two
//! differentials: total yardage and yards per play. Ratings are the fixed
//! point of "average margin plus average opponent rating", iterated for a
//! fixed number of rounds and then zero-centred.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::games::GameRecord;
use crate::team_features::TeamId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SrsParams {
    pub yards_per_point: f64,
    pub ypp_per_point: f64,
    pub iterations: usize,
}

impl Default for SrsParams {
    fn default() -> Self {
        Self {
            yards_per_point: 14.0,
            ypp_per_point: 0.12,
            iterations: 1000,
        }
    }
}

/// Home-perspective implied margin for one game, or `None` without a usable box score.
pub fn implied_margin(game: &GameRecord, params: &SrsParams) -> Option<f64> {
    let (home_ypp, away_ypp) = game.yards_per_play()?;
    let yard_diff = game.home_yards? - game.away_yards?;
    let margin = (yard_diff / params.yards_per_point + (home_ypp - away_ypp) / params.ypp_per_point) / 2.0;
    margin.is_finite().then_some(margin)
}

struct Edge {
    home: TeamId,
    away: TeamId,
    margin: f64,
}

pub fn solve(games: &[GameRecord], params: &SrsParams) -> BTreeMap<TeamId, f64> {
    solve_from(games, &BTreeMap::new(), params)
}

/// Same as [`solve`] but starting from `initial` (teams absent from it start at 0).
pub fn solve_from(
    games: &[GameRecord],
    initial: &BTreeMap<TeamId, f64>,
    params: &SrsParams,
) -> BTreeMap<TeamId, f64> {
    let edges: Vec<Edge> = games
        .iter()
        .filter(|g| g.home_id != g.away_id)
        .filter_map(|g| {
            implied_margin(g, params).map(|margin| Edge {
                home: g.home_id,
                away: g.away_id,
                margin,
            })
        })
        .collect();

    let mut ratings: BTreeMap<TeamId, f64> = BTreeMap::new();
    for e in &edges {
        for id in [e.home, e.away] {
            ratings
                .entry(id)
                .or_insert_with(|| initial.get(&id).copied().unwrap_or(0.0));
        }
    }
    if ratings.is_empty() {
        return ratings;
    }

    for _ in 0..params.iterations {
        let mut sums: BTreeMap<TeamId, (f64, usize)> = ratings.keys().map(|id| (*id, (0.0, 0))).collect();
        for e in &edges {
            let home_r = ratings[&e.home];
            let away_r = ratings[&e.away];
            if let Some(s) = sums.get_mut(&e.home) {
                s.0 += e.margin + away_r;
                s.1 += 1;
            }
            if let Some(s) = sums.get_mut(&e.away) {
                s.0 += -e.margin + home_r;
                s.1 += 1;
            }
        }
        ratings = sums
            .into_iter()
            .map(|(id, (sum, n))| (id, if n == 0 { 0.0 } else { sum / n as f64 }))
            .collect();
    }

    let mean = ratings.values().sum::<f64>() / ratings.len() as f64;
    for r in ratings.values_mut() {
        *r -= mean;
    }
    ratings
}
