use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TeamId = u32;

/// Every per-team observable the rating pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    OffYardsPerPlay,
    OffPassYardsPerAttempt,
    OffRushYardsPerCarry,
    OffSuccessRate,
    OffEpaPerPlay,
    Pace,
    DefYardsPerPlay,
    DefPassYardsPerAttempt,
    DefRushYardsPerCarry,
    DefSuccessRate,
    DefEpaPerPlay,
    TalentComposite,
    BlueChipPct,
    CommitSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGroup {
    Offense,
    Defense,
    Talent,
}

impl Metric {
    pub const ALL: [Metric; 14] = [
        Metric::OffYardsPerPlay,
        Metric::OffPassYardsPerAttempt,
        Metric::OffRushYardsPerCarry,
        Metric::OffSuccessRate,
        Metric::OffEpaPerPlay,
        Metric::Pace,
        Metric::DefYardsPerPlay,
        Metric::DefPassYardsPerAttempt,
        Metric::DefRushYardsPerCarry,
        Metric::DefSuccessRate,
        Metric::DefEpaPerPlay,
        Metric::TalentComposite,
        Metric::BlueChipPct,
        Metric::CommitSignal,
    ];

    pub fn group(self) -> MetricGroup {
        match self {
            Metric::OffYardsPerPlay
            | Metric::OffPassYardsPerAttempt
            | Metric::OffRushYardsPerCarry
            | Metric::OffSuccessRate
            | Metric::OffEpaPerPlay
            | Metric::Pace => MetricGroup::Offense,
            Metric::DefYardsPerPlay
            | Metric::DefPassYardsPerAttempt
            | Metric::DefRushYardsPerCarry
            | Metric::DefSuccessRate
            | Metric::DefEpaPerPlay => MetricGroup::Defense,
            Metric::TalentComposite | Metric::BlueChipPct | Metric::CommitSignal => {
                MetricGroup::Talent
            }
        }
    }

    /// Whether opponent-strength adjustment rescales this metric.
    /// Pace is a tempo choice, not an outcome against an opponent.
    pub fn opponent_sensitive(self) -> bool {
        !matches!(self.group(), MetricGroup::Talent) && self != Metric::Pace
    }

    pub fn key(self) -> &'static str {
        match self {
            Metric::OffYardsPerPlay => "off_yards_per_play",
            Metric::OffPassYardsPerAttempt => "off_pass_yards_per_attempt",
            Metric::OffRushYardsPerCarry => "off_rush_yards_per_carry",
            Metric::OffSuccessRate => "off_success_rate",
            Metric::OffEpaPerPlay => "off_epa_per_play",
            Metric::Pace => "pace",
            Metric::DefYardsPerPlay => "def_yards_per_play",
            Metric::DefPassYardsPerAttempt => "def_pass_yards_per_attempt",
            Metric::DefRushYardsPerCarry => "def_rush_yards_per_carry",
            Metric::DefSuccessRate => "def_success_rate",
            Metric::DefEpaPerPlay => "def_epa_per_play",
            Metric::TalentComposite => "talent_composite",
            Metric::BlueChipPct => "blue_chip_pct",
            Metric::CommitSignal => "commit_signal",
        }
    }

    pub fn from_key(raw: &str) -> Option<Metric> {
        let k = raw.trim().to_ascii_lowercase();
        Metric::ALL.iter().copied().find(|m| m.key() == k)
    }

    pub fn in_group(group: MetricGroup) -> impl Iterator<Item = Metric> {
        Metric::ALL.into_iter().filter(move |m| m.group() == group)
    }
}

/// Which fallback tier produced a team's performance metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    GameLevel,
    SeasonAggregate,
    Baseline,
    Missing,
}

impl DataSource {
    pub const ALL: [DataSource; 4] = [
        DataSource::GameLevel,
        DataSource::SeasonAggregate,
        DataSource::Baseline,
        DataSource::Missing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::GameLevel => "game_level",
            DataSource::SeasonAggregate => "season_aggregate",
            DataSource::Baseline => "baseline",
            DataSource::Missing => "missing",
        }
    }

    pub fn parse(raw: &str) -> Option<DataSource> {
        DataSource::ALL.iter().copied().find(|s| s.as_str() == raw)
    }
}

/// Raw offensive/defensive efficiency numbers for one team, any of which may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default)]
    pub off_yards_per_play: Option<f64>,
    #[serde(default)]
    pub off_pass_yards_per_attempt: Option<f64>,
    #[serde(default)]
    pub off_rush_yards_per_carry: Option<f64>,
    #[serde(default)]
    pub off_success_rate: Option<f64>,
    #[serde(default)]
    pub off_epa_per_play: Option<f64>,
    #[serde(default)]
    pub pace: Option<f64>,
    #[serde(default)]
    pub def_yards_per_play: Option<f64>,
    #[serde(default)]
    pub def_pass_yards_per_attempt: Option<f64>,
    #[serde(default)]
    pub def_rush_yards_per_carry: Option<f64>,
    #[serde(default)]
    pub def_success_rate: Option<f64>,
    #[serde(default)]
    pub def_epa_per_play: Option<f64>,
}

impl PerformanceMetrics {
    pub fn is_empty(&self) -> bool {
        Metric::ALL
            .iter()
            .filter(|m| m.group() != MetricGroup::Talent)
            .all(|m| self.get(*m).is_none())
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::OffYardsPerPlay => self.off_yards_per_play,
            Metric::OffPassYardsPerAttempt => self.off_pass_yards_per_attempt,
            Metric::OffRushYardsPerCarry => self.off_rush_yards_per_carry,
            Metric::OffSuccessRate => self.off_success_rate,
            Metric::OffEpaPerPlay => self.off_epa_per_play,
            Metric::Pace => self.pace,
            Metric::DefYardsPerPlay => self.def_yards_per_play,
            Metric::DefPassYardsPerAttempt => self.def_pass_yards_per_attempt,
            Metric::DefRushYardsPerCarry => self.def_rush_yards_per_carry,
            Metric::DefSuccessRate => self.def_success_rate,
            Metric::DefEpaPerPlay => self.def_epa_per_play,
            Metric::TalentComposite | Metric::BlueChipPct | Metric::CommitSignal => None,
        }
    }

    fn slot(&mut self, metric: Metric) -> Option<&mut Option<f64>> {
        let slot = match metric {
            Metric::OffYardsPerPlay => &mut self.off_yards_per_play,
            Metric::OffPassYardsPerAttempt => &mut self.off_pass_yards_per_attempt,
            Metric::OffRushYardsPerCarry => &mut self.off_rush_yards_per_carry,
            Metric::OffSuccessRate => &mut self.off_success_rate,
            Metric::OffEpaPerPlay => &mut self.off_epa_per_play,
            Metric::Pace => &mut self.pace,
            Metric::DefYardsPerPlay => &mut self.def_yards_per_play,
            Metric::DefPassYardsPerAttempt => &mut self.def_pass_yards_per_attempt,
            Metric::DefRushYardsPerCarry => &mut self.def_rush_yards_per_carry,
            Metric::DefSuccessRate => &mut self.def_success_rate,
            Metric::DefEpaPerPlay => &mut self.def_epa_per_play,
            Metric::TalentComposite | Metric::BlueChipPct | Metric::CommitSignal => return None,
        };
        Some(slot)
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        if let Some(slot) = self.slot(metric) {
            *slot = value;
        }
    }
}

/// Season-level recruiting signal. Loaded independently of the performance tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TalentMetrics {
    #[serde(default)]
    pub talent_composite: Option<f64>,
    #[serde(default)]
    pub blue_chip_pct: Option<f64>,
    #[serde(default)]
    pub commit_signal: Option<f64>,
}

impl TalentMetrics {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::TalentComposite => self.talent_composite,
            Metric::BlueChipPct => self.blue_chip_pct,
            Metric::CommitSignal => self.commit_signal,
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.talent_composite.is_none() && self.blue_chip_pct.is_none() && self.commit_signal.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamFeatures {
    pub team_id: TeamId,
    pub season: i32,
    pub performance: PerformanceMetrics,
    pub talent: TalentMetrics,
    pub games_count: u32,
    pub confidence: f64,
    pub data_source: DataSource,
    /// Set when the store errored for this team and it was demoted to `Missing`.
    pub load_failed: bool,
    pub last_updated: DateTime<Utc>,
}

impl TeamFeatures {
    pub fn missing(team_id: TeamId, season: i32) -> Self {
        Self {
            team_id,
            season,
            performance: PerformanceMetrics::default(),
            talent: TalentMetrics::default(),
            games_count: 0,
            confidence: 0.0,
            data_source: DataSource::Missing,
            load_failed: false,
            last_updated: Utc::now(),
        }
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric.group() {
            MetricGroup::Talent => self.talent.get(metric),
            MetricGroup::Offense | MetricGroup::Defense => self.performance.get(metric),
        }
    }

    pub fn has_core_features(&self) -> bool {
        !self.performance.is_empty()
    }

    /// Copy with every opponent-sensitive metric of `group` multiplied by `factor`.
    /// The receiver is left untouched.
    pub fn scaled_copy(&self, group: MetricGroup, factor: f64) -> TeamFeatures {
        let mut out = self.clone();
        for metric in Metric::in_group(group).filter(|m| m.opponent_sensitive()) {
            let scaled = self.performance.get(metric).map(|v| v * factor);
            out.performance.set(metric, scaled);
        }
        out
    }
}

/// One game's box-score-derived efficiency line for one team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamGameStats {
    pub game_id: u64,
    pub team_id: TeamId,
    pub season: i32,
    pub metrics: PerformanceMetrics,
}
