use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::team_features::TeamId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: u64,
    pub season: i32,
    #[serde(default)]
    pub week: Option<u32>,
    pub home_id: TeamId,
    pub away_id: TeamId,
    pub home_yards: Option<f64>,
    pub away_yards: Option<f64>,
    pub home_plays: Option<u32>,
    pub away_plays: Option<u32>,
    #[serde(default)]
    pub neutral_site: bool,
    #[serde(default = "default_completed")]
    pub completed: bool,
}

fn default_completed() -> bool {
    true
}

impl GameRecord {
    /// A game contributes box-score signal only once it is final and both sides ran plays.
    pub fn has_box_score(&self) -> bool {
        self.completed
            && self.home_yards.is_some()
            && self.away_yards.is_some()
            && self.home_plays.is_some_and(|p| p > 0)
            && self.away_plays.is_some_and(|p| p > 0)
    }

    pub fn involves(&self, team_id: TeamId) -> bool {
        self.home_id == team_id || self.away_id == team_id
    }

    pub fn opponent_of(&self, team_id: TeamId) -> Option<TeamId> {
        if self.home_id == team_id {
            Some(self.away_id)
        } else if self.away_id == team_id {
            Some(self.home_id)
        } else {
            None
        }
    }

    pub fn yards_per_play(&self) -> Option<(f64, f64)> {
        if !self.has_box_score() {
            return None;
        }
        let (Some(hy), Some(ay), Some(hp), Some(ap)) = (
            self.home_yards,
            self.away_yards,
            self.home_plays,
            self.away_plays,
        ) else {
            return None;
        };
        Some((hy / hp as f64, ay / ap as f64))
    }
}

/// Completed opponents per team, in game order. Self-matches and unknown sides are ignored.
pub fn opponents_by_team(games: &[GameRecord]) -> BTreeMap<TeamId, Vec<TeamId>> {
    let mut out: BTreeMap<TeamId, Vec<TeamId>> = BTreeMap::new();
    for g in games.iter().filter(|g| g.completed && g.home_id != g.away_id) {
        out.entry(g.home_id).or_default().push(g.away_id);
        out.entry(g.away_id).or_default().push(g.home_id);
    }
    out
}

/// Collapse per-team game lists (which list every game twice) into one list keyed by game id.
pub fn dedup_games<'a>(lists: impl IntoIterator<Item = &'a Vec<GameRecord>>) -> Vec<GameRecord> {
    let mut by_id: BTreeMap<u64, GameRecord> = BTreeMap::new();
    for list in lists {
        for g in list {
            by_id.entry(g.game_id).or_insert_with(|| g.clone());
        }
    }
    by_id.into_values().collect()
}
