use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::games::GameRecord;
use crate::team_features::{PerformanceMetrics, TalentMetrics, TeamGameStats, TeamId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeasonAggregate {
    pub metrics: PerformanceMetrics,
    pub games_count: u32,
}

/// Preseason offense/defense expectation in rating (z-score) units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingPrior {
    pub offense: f64,
    pub defense: f64,
}

/// Read side of the per-team, per-season statistical observations.
pub trait FeatureStore: Send + Sync {
    fn roster(&self, season: i32) -> Result<BTreeSet<TeamId>>;
    fn team_game_stats(&self, team_id: TeamId, season: i32) -> Result<Vec<TeamGameStats>>;
    fn season_aggregate(&self, team_id: TeamId, season: i32) -> Result<Option<SeasonAggregate>>;
    fn preseason_baseline(&self, team_id: TeamId, season: i32) -> Result<Option<PerformanceMetrics>>;
    fn talent(&self, team_id: TeamId, season: i32) -> Result<Option<TalentMetrics>>;
    fn games_for_team(&self, team_id: TeamId, season: i32) -> Result<Vec<GameRecord>>;
    fn prior_rating(&self, team_id: TeamId, season: i32) -> Result<Option<RatingPrior>>;
}

const PERF_COLUMNS: &str = "off_ypp, off_pass_ypa, off_rush_ypc, off_success_rate, off_epa, pace, \
     def_ypp, def_pass_ypa, def_rush_ypc, def_success_rate, def_epa";

pub fn init_feature_schema(conn: &Connection) -> Result<()> {
    let perf = r#"
            off_ypp REAL NULL,
            off_pass_ypa REAL NULL,
            off_rush_ypc REAL NULL,
            off_success_rate REAL NULL,
            off_epa REAL NULL,
            pace REAL NULL,
            def_ypp REAL NULL,
            def_pass_ypa REAL NULL,
            def_rush_ypc REAL NULL,
            def_success_rate REAL NULL,
            def_epa REAL NULL"#;
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS rosters (
            season INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            team_name TEXT NULL,
            PRIMARY KEY (season, team_id)
        );
        CREATE TABLE IF NOT EXISTS team_game_stats (
            game_id INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,{perf},
            PRIMARY KEY (game_id, team_id)
        );
        CREATE INDEX IF NOT EXISTS idx_tgs_team_season ON team_game_stats(team_id, season);
        CREATE TABLE IF NOT EXISTS season_aggregates (
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,
            games_count INTEGER NOT NULL,{perf},
            PRIMARY KEY (team_id, season)
        );
        CREATE TABLE IF NOT EXISTS preseason_baselines (
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,{perf},
            PRIMARY KEY (team_id, season)
        );
        CREATE TABLE IF NOT EXISTS talent (
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,
            talent_composite REAL NULL,
            blue_chip_pct REAL NULL,
            commit_signal REAL NULL,
            PRIMARY KEY (team_id, season)
        );
        CREATE TABLE IF NOT EXISTS rating_priors (
            team_id INTEGER NOT NULL,
            season INTEGER NOT NULL,
            offense REAL NOT NULL,
            defense REAL NOT NULL,
            PRIMARY KEY (team_id, season)
        );
        CREATE TABLE IF NOT EXISTS games (
            game_id INTEGER PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NULL,
            home_id INTEGER NOT NULL,
            away_id INTEGER NOT NULL,
            home_yards REAL NULL,
            away_yards REAL NULL,
            home_plays INTEGER NULL,
            away_plays INTEGER NULL,
            neutral_site INTEGER NOT NULL,
            completed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_games_season ON games(season);
        "#
    ))
    .context("create feature schema")?;
    Ok(())
}

fn perf_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<PerformanceMetrics> {
    Ok(PerformanceMetrics {
        off_yards_per_play: row.get(offset)?,
        off_pass_yards_per_attempt: row.get(offset + 1)?,
        off_rush_yards_per_carry: row.get(offset + 2)?,
        off_success_rate: row.get(offset + 3)?,
        off_epa_per_play: row.get(offset + 4)?,
        pace: row.get(offset + 5)?,
        def_yards_per_play: row.get(offset + 6)?,
        def_pass_yards_per_attempt: row.get(offset + 7)?,
        def_rush_yards_per_carry: row.get(offset + 8)?,
        def_success_rate: row.get(offset + 9)?,
        def_epa_per_play: row.get(offset + 10)?,
    })
}

fn perf_values(m: &PerformanceMetrics) -> [Option<f64>; 11] {
    [
        m.off_yards_per_play,
        m.off_pass_yards_per_attempt,
        m.off_rush_yards_per_carry,
        m.off_success_rate,
        m.off_epa_per_play,
        m.pace,
        m.def_yards_per_play,
        m.def_pass_yards_per_attempt,
        m.def_rush_yards_per_carry,
        m.def_success_rate,
        m.def_epa_per_play,
    ]
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<GameRecord> {
    Ok(GameRecord {
        game_id: row.get::<_, i64>(0)? as u64,
        season: row.get(1)?,
        week: row.get(2)?,
        home_id: row.get(3)?,
        away_id: row.get(4)?,
        home_yards: row.get(5)?,
        away_yards: row.get(6)?,
        home_plays: row.get(7)?,
        away_plays: row.get(8)?,
        neutral_site: row.get::<_, i64>(9)? != 0,
        completed: row.get::<_, i64>(10)? != 0,
    })
}

const GAME_COLUMNS: &str = "game_id, season, week, home_id, away_id, home_yards, away_yards, \
     home_plays, away_plays, neutral_site, completed";

/// SQLite-backed feature store. Access is serialized behind a mutex so the
/// loader can fan out across threads.
pub struct SqliteFeatureStore {
    conn: Mutex<Connection>,
}

impl SqliteFeatureStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("enable WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("open in-memory sqlite")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_feature_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("feature store connection mutex poisoned"))
    }

    pub fn add_roster_team(&self, season: i32, team_id: TeamId, name: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        write_roster_team(&conn, season, team_id, name)
    }

    pub fn upsert_team_game_stats(&self, stats: &TeamGameStats) -> Result<()> {
        let conn = self.conn()?;
        write_team_game_stats(&conn, stats)
    }

    pub fn upsert_season_aggregate(&self, team_id: TeamId, season: i32, agg: &SeasonAggregate) -> Result<()> {
        let conn = self.conn()?;
        write_season_aggregate(&conn, team_id, season, agg)
    }

    pub fn upsert_preseason_baseline(&self, team_id: TeamId, season: i32, metrics: &PerformanceMetrics) -> Result<()> {
        let conn = self.conn()?;
        write_baseline(&conn, team_id, season, metrics)
    }

    pub fn upsert_talent(&self, team_id: TeamId, season: i32, talent: &TalentMetrics) -> Result<()> {
        let conn = self.conn()?;
        write_talent(&conn, team_id, season, talent)
    }

    pub fn upsert_prior(&self, team_id: TeamId, season: i32, prior: &RatingPrior) -> Result<()> {
        let conn = self.conn()?;
        write_prior(&conn, team_id, season, prior)
    }

    pub fn upsert_game(&self, game: &GameRecord) -> Result<()> {
        let conn = self.conn()?;
        write_game(&conn, game)
    }

    /// Write a whole season bundle in one transaction. Rows are forced onto `bundle.season`.
    pub fn import_bundle(&self, bundle: &SeasonBundle) -> Result<ImportSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin import transaction")?;
        let season = bundle.season;
        for team in &bundle.teams {
            write_roster_team(&tx, season, team.team_id, team.name.as_deref())?;
            if let Some(agg) = &team.season_aggregate {
                write_season_aggregate(&tx, team.team_id, season, agg)?;
            }
            if let Some(base) = &team.preseason_baseline {
                write_baseline(&tx, team.team_id, season, base)?;
            }
            if let Some(talent) = &team.talent {
                write_talent(&tx, team.team_id, season, talent)?;
            }
            if let Some(prior) = &team.prior {
                write_prior(&tx, team.team_id, season, prior)?;
            }
        }
        for stats in &bundle.game_stats {
            write_team_game_stats(&tx, &TeamGameStats { season, ..*stats })?;
        }
        for game in &bundle.games {
            write_game(&tx, &GameRecord { season, ..game.clone() })?;
        }
        tx.commit().context("commit import transaction")?;
        Ok(ImportSummary {
            season,
            teams: bundle.teams.len(),
            game_stats: bundle.game_stats.len(),
            games: bundle.games.len(),
        })
    }
}

fn write_roster_team(conn: &Connection, season: i32, team_id: TeamId, name: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO rosters(season, team_id, team_name) VALUES (?1, ?2, ?3)
         ON CONFLICT(season, team_id) DO UPDATE SET team_name = excluded.team_name",
        params![season, team_id, name],
    )
    .context("upsert roster team")?;
    Ok(())
}

fn write_team_game_stats(conn: &Connection, stats: &TeamGameStats) -> Result<()> {
    let v = perf_values(&stats.metrics);
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO team_game_stats(game_id, team_id, season, {PERF_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            stats.game_id as i64,
            stats.team_id,
            stats.season,
            v[0],
            v[1],
            v[2],
            v[3],
            v[4],
            v[5],
            v[6],
            v[7],
            v[8],
            v[9],
            v[10]
        ],
    )
    .context("upsert team game stats")?;
    Ok(())
}

fn write_season_aggregate(conn: &Connection, team_id: TeamId, season: i32, agg: &SeasonAggregate) -> Result<()> {
    let v = perf_values(&agg.metrics);
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO season_aggregates(team_id, season, games_count, {PERF_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            team_id,
            season,
            agg.games_count,
            v[0],
            v[1],
            v[2],
            v[3],
            v[4],
            v[5],
            v[6],
            v[7],
            v[8],
            v[9],
            v[10]
        ],
    )
    .context("upsert season aggregate")?;
    Ok(())
}

fn write_baseline(conn: &Connection, team_id: TeamId, season: i32, metrics: &PerformanceMetrics) -> Result<()> {
    let v = perf_values(metrics);
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO preseason_baselines(team_id, season, {PERF_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![team_id, season, v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8], v[9], v[10]],
    )
    .context("upsert preseason baseline")?;
    Ok(())
}

fn write_talent(conn: &Connection, team_id: TeamId, season: i32, talent: &TalentMetrics) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO talent(team_id, season, talent_composite, blue_chip_pct, commit_signal)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            team_id,
            season,
            talent.talent_composite,
            talent.blue_chip_pct,
            talent.commit_signal
        ],
    )
    .context("upsert talent")?;
    Ok(())
}

fn write_prior(conn: &Connection, team_id: TeamId, season: i32, prior: &RatingPrior) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO rating_priors(team_id, season, offense, defense) VALUES (?1, ?2, ?3, ?4)",
        params![team_id, season, prior.offense, prior.defense],
    )
    .context("upsert rating prior")?;
    Ok(())
}

fn write_game(conn: &Connection, g: &GameRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO games({GAME_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            g.game_id as i64,
            g.season,
            g.week,
            g.home_id,
            g.away_id,
            g.home_yards,
            g.away_yards,
            g.home_plays,
            g.away_plays,
            g.neutral_site as i64,
            g.completed as i64
        ],
    )
    .context("upsert game")?;
    Ok(())
}

impl FeatureStore for SqliteFeatureStore {
    fn roster(&self, season: i32) -> Result<BTreeSet<TeamId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT team_id FROM rosters WHERE season = ?1")
            .context("prepare roster query")?;
        let rows = stmt
            .query_map(params![season], |row| row.get::<_, TeamId>(0))
            .context("query roster")?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row.context("decode roster row")?);
        }
        Ok(out)
    }

    fn team_game_stats(&self, team_id: TeamId, season: i32) -> Result<Vec<TeamGameStats>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT game_id, team_id, season, {PERF_COLUMNS} FROM team_game_stats
                 WHERE team_id = ?1 AND season = ?2 ORDER BY game_id ASC"
            ))
            .context("prepare team game stats query")?;
        let rows = stmt
            .query_map(params![team_id, season], |row| {
                Ok(TeamGameStats {
                    game_id: row.get::<_, i64>(0)? as u64,
                    team_id: row.get(1)?,
                    season: row.get(2)?,
                    metrics: perf_from_row(row, 3)?,
                })
            })
            .context("query team game stats")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode team game stats row")?);
        }
        Ok(out)
    }

    fn season_aggregate(&self, team_id: TeamId, season: i32) -> Result<Option<SeasonAggregate>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT games_count, {PERF_COLUMNS} FROM season_aggregates WHERE team_id = ?1 AND season = ?2"
                ),
                params![team_id, season],
                |row| {
                    Ok(SeasonAggregate {
                        games_count: row.get(0)?,
                        metrics: perf_from_row(row, 1)?,
                    })
                },
            )
            .optional()
            .context("query season aggregate")
    }

    fn preseason_baseline(&self, team_id: TeamId, season: i32) -> Result<Option<PerformanceMetrics>> {
        self.conn()?
            .query_row(
                &format!("SELECT {PERF_COLUMNS} FROM preseason_baselines WHERE team_id = ?1 AND season = ?2"),
                params![team_id, season],
                |row| perf_from_row(row, 0),
            )
            .optional()
            .context("query preseason baseline")
    }

    fn talent(&self, team_id: TeamId, season: i32) -> Result<Option<TalentMetrics>> {
        self.conn()?
            .query_row(
                "SELECT talent_composite, blue_chip_pct, commit_signal FROM talent WHERE team_id = ?1 AND season = ?2",
                params![team_id, season],
                |row| {
                    Ok(TalentMetrics {
                        talent_composite: row.get(0)?,
                        blue_chip_pct: row.get(1)?,
                        commit_signal: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("query talent")
    }

    fn games_for_team(&self, team_id: TeamId, season: i32) -> Result<Vec<GameRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GAME_COLUMNS} FROM games
                 WHERE season = ?1 AND (home_id = ?2 OR away_id = ?2)
                 ORDER BY game_id ASC"
            ))
            .context("prepare team games query")?;
        let rows = stmt
            .query_map(params![season, team_id], game_from_row)
            .context("query team games")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode game row")?);
        }
        Ok(out)
    }

    fn prior_rating(&self, team_id: TeamId, season: i32) -> Result<Option<RatingPrior>> {
        self.conn()?
            .query_row(
                "SELECT offense, defense FROM rating_priors WHERE team_id = ?1 AND season = ?2",
                params![team_id, season],
                |row| {
                    Ok(RatingPrior {
                        offense: row.get(0)?,
                        defense: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("query rating prior")
    }
}

/// JSON interchange shape for one season of source data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeasonBundle {
    pub season: i32,
    pub teams: Vec<BundleTeam>,
    #[serde(default)]
    pub game_stats: Vec<TeamGameStats>,
    #[serde(default)]
    pub games: Vec<GameRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleTeam {
    pub team_id: TeamId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub season_aggregate: Option<SeasonAggregate>,
    #[serde(default)]
    pub preseason_baseline: Option<PerformanceMetrics>,
    #[serde(default)]
    pub talent: Option<TalentMetrics>,
    #[serde(default)]
    pub prior: Option<RatingPrior>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportSummary {
    pub season: i32,
    pub teams: usize,
    pub game_stats: usize,
    pub games: usize,
}

pub fn read_bundle(path: &Path) -> Result<SeasonBundle> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read bundle {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse bundle {}", path.display()))
}
