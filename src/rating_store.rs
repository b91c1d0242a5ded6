use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::stage_stats::{InstrumentationLog, StageStats};
use crate::team_features::{DataSource, TeamId};

/// Final, post-shrinkage, post-calibration rating for one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub team_id: TeamId,
    pub offense_rating: f64,
    pub defense_rating: f64,
    pub power_rating: f64,
    pub confidence: f64,
    pub data_source: DataSource,
    pub shrinkage_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<RunStatus> {
        match raw {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: i64,
    pub season: i32,
    pub model_version: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub upsert_failures: usize,
}

/// Write side for final ratings plus the run ledger and its stage snapshots.
pub trait RatingStore {
    fn begin_run(&mut self, season: i32, model_version: &str) -> Result<i64>;
    fn upsert(&mut self, season: i32, model_version: &str, rating: &TeamRating) -> Result<()>;
    fn read_back(&self, season: i32, model_version: &str) -> Result<Vec<TeamRating>>;
    fn record_stage_stats(&mut self, run_id: i64, log: &InstrumentationLog) -> Result<()>;
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        failure_reason: Option<&str>,
        upsert_failures: usize,
    ) -> Result<()>;
}

pub struct SqliteRatingStore {
    conn: Connection,
}

impl SqliteRatingStore {
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

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_rating_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, season, model_version, started_at, finished_at, status, failure_reason, upsert_failures
                 FROM rating_runs WHERE run_id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()
            .context("query rating run")
    }

    pub fn latest_run(&self, season: i32, model_version: &str) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, season, model_version, started_at, finished_at, status, failure_reason, upsert_failures
                 FROM rating_runs WHERE season = ?1 AND model_version = ?2
                 ORDER BY run_id DESC LIMIT 1",
                params![season, model_version],
                run_from_row,
            )
            .optional()
            .context("query latest rating run")
    }

    pub fn stage_stats(&self, run_id: i64) -> Result<Vec<StageStats>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT stage, count, mean, stddev, min, max, zero_count, zero_pct
                 FROM stage_stats WHERE run_id = ?1 ORDER BY seq ASC",
            )
            .context("prepare stage stats query")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StageStats {
                    stage: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    mean: row.get(2)?,
                    stddev: row.get(3)?,
                    min: row.get(4)?,
                    max: row.get(5)?,
                    zero_count: row.get::<_, i64>(6)? as usize,
                    zero_pct: row.get(7)?,
                })
            })
            .context("query stage stats")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode stage stats row")?);
        }
        Ok(out)
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(5)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        season: row.get(1)?,
        model_version: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        failure_reason: row.get(6)?,
        upsert_failures: row.get::<_, i64>(7)? as usize,
    })
}

pub fn init_rating_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS team_ratings (
            season INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            model_version TEXT NOT NULL,
            offense_rating REAL NOT NULL,
            defense_rating REAL NOT NULL,
            power_rating REAL NOT NULL,
            confidence REAL NOT NULL,
            data_source TEXT NOT NULL,
            shrinkage_factor REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (season, team_id, model_version)
        );
        CREATE TABLE IF NOT EXISTS rating_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            season INTEGER NOT NULL,
            model_version TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            status TEXT NOT NULL,
            failure_reason TEXT NULL,
            upsert_failures INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS stage_stats (
            run_id INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            stage TEXT NOT NULL,
            count INTEGER NOT NULL,
            mean REAL NOT NULL,
            stddev REAL NOT NULL,
            min REAL NOT NULL,
            max REAL NOT NULL,
            zero_count INTEGER NOT NULL,
            zero_pct REAL NOT NULL,
            PRIMARY KEY (run_id, seq)
        );
        "#,
    )
    .context("create rating schema")?;
    Ok(())
}

impl RatingStore for SqliteRatingStore {
    fn begin_run(&mut self, season: i32, model_version: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO rating_runs(season, model_version, started_at, finished_at, status, failure_reason, upsert_failures)
                 VALUES (?1, ?2, ?3, NULL, ?4, NULL, 0)",
                params![
                    season,
                    model_version,
                    Utc::now().to_rfc3339(),
                    RunStatus::Running.as_str()
                ],
            )
            .context("insert rating run")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn upsert(&mut self, season: i32, model_version: &str, r: &TeamRating) -> Result<()> {
        if !(r.offense_rating.is_finite() && r.defense_rating.is_finite() && r.power_rating.is_finite()) {
            return Err(anyhow!("refusing to store non-finite rating for team {}", r.team_id));
        }
        self.conn
            .execute(
                "INSERT INTO team_ratings(season, team_id, model_version, offense_rating, defense_rating,
                     power_rating, confidence, data_source, shrinkage_factor, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(season, team_id, model_version) DO UPDATE SET
                     offense_rating = excluded.offense_rating,
                     defense_rating = excluded.defense_rating,
                     power_rating = excluded.power_rating,
                     confidence = excluded.confidence,
                     data_source = excluded.data_source,
                     shrinkage_factor = excluded.shrinkage_factor,
                     updated_at = excluded.updated_at",
                params![
                    season,
                    r.team_id,
                    model_version,
                    r.offense_rating,
                    r.defense_rating,
                    r.power_rating,
                    r.confidence,
                    r.data_source.as_str(),
                    r.shrinkage_factor,
                    Utc::now().to_rfc3339()
                ],
            )
            .with_context(|| format!("upsert rating for team {}", r.team_id))?;
        Ok(())
    }

    fn read_back(&self, season: i32, model_version: &str) -> Result<Vec<TeamRating>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT team_id, offense_rating, defense_rating, power_rating, confidence, data_source, shrinkage_factor
                 FROM team_ratings WHERE season = ?1 AND model_version = ?2 ORDER BY team_id ASC",
            )
            .context("prepare read-back query")?;
        let rows = stmt
            .query_map(params![season, model_version], |row| {
                let source: String = row.get(5)?;
                Ok(TeamRating {
                    team_id: row.get(0)?,
                    offense_rating: row.get(1)?,
                    defense_rating: row.get(2)?,
                    power_rating: row.get(3)?,
                    confidence: row.get(4)?,
                    data_source: DataSource::parse(&source).unwrap_or(DataSource::Missing),
                    shrinkage_factor: row.get(6)?,
                })
            })
            .context("query read-back")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode rating row")?);
        }
        Ok(out)
    }

    fn record_stage_stats(&mut self, run_id: i64, log: &InstrumentationLog) -> Result<()> {
        let tx = self.conn.transaction().context("begin stage stats transaction")?;
        tx.execute("DELETE FROM stage_stats WHERE run_id = ?1", params![run_id])
            .context("clear stage stats")?;
        for (seq, s) in log.entries().iter().enumerate() {
            tx.execute(
                "INSERT INTO stage_stats(run_id, seq, stage, count, mean, stddev, min, max, zero_count, zero_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    seq as i64,
                    s.stage,
                    s.count as i64,
                    s.mean,
                    s.stddev,
                    s.min,
                    s.max,
                    s.zero_count as i64,
                    s.zero_pct
                ],
            )
            .context("insert stage stats")?;
        }
        tx.commit().context("commit stage stats")?;
        Ok(())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        failure_reason: Option<&str>,
        upsert_failures: usize,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE rating_runs
                 SET finished_at = ?1, status = ?2, failure_reason = ?3, upsert_failures = ?4
                 WHERE run_id = ?5",
                params![
                    Utc::now().to_rfc3339(),
                    status.as_str(),
                    failure_reason,
                    upsert_failures as i64,
                    run_id
                ],
            )
            .context("update rating run")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(team_id: TeamId, power: f64) -> TeamRating {
        TeamRating {
            team_id,
            offense_rating: power / 2.0,
            defense_rating: power / 2.0,
            power_rating: power,
            confidence: 0.8,
            data_source: DataSource::GameLevel,
            shrinkage_factor: 0.2,
        }
    }

    #[test]
    fn upsert_overwrites_and_reads_back_in_team_order() {
        let mut store = SqliteRatingStore::open_in_memory().unwrap();
        store.upsert(2024, "v1", &rating(7, 1.5)).unwrap();
        store.upsert(2024, "v1", &rating(3, -2.0)).unwrap();
        store.upsert(2024, "v1", &rating(7, 4.25)).unwrap();
        store.upsert(2024, "v2", &rating(7, 9.0)).unwrap();
        let back = store.read_back(2024, "v1").unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].team_id, 3);
        assert_eq!(back[1].power_rating, 4.25);
    }

    #[test]
    fn non_finite_ratings_are_rejected() {
        let mut store = SqliteRatingStore::open_in_memory().unwrap();
        assert!(store.upsert(2024, "v1", &rating(1, f64::NAN)).is_err());
        assert!(store.read_back(2024, "v1").unwrap().is_empty());
    }

    #[test]
    fn run_ledger_tracks_status() {
        let mut store = SqliteRatingStore::open_in_memory().unwrap();
        let run_id = store.begin_run(2024, "v1").unwrap();
        assert_eq!(store.run(run_id).unwrap().unwrap().status, RunStatus::Running);
        store
            .finish_run(run_id, RunStatus::Failed, Some("gate A"), 2)
            .unwrap();
        let run = store.latest_run(2024, "v1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("gate A"));
        assert_eq!(run.upsert_failures, 2);
    }
}
