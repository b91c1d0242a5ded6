use std::fs;

use cfb_ratings::audit_export::export_audit;
use cfb_ratings::config::{DEFAULT_MODEL_VERSION, ModelRegistry};
use cfb_ratings::engine;
use cfb_ratings::feature_store::{FeatureStore, SqliteFeatureStore, read_bundle};
use cfb_ratings::rating_store::{RatingStore, SqliteRatingStore};
use cfb_ratings::synthetic::{self, SyntheticParams};

const BUNDLE_JSON: &str = r#"{
  "season": 2022,
  "teams": [
    {"team_id": 1, "name": "North",
     "season_aggregate": {"metrics": {"off_yards_per_play": 6.1, "def_yards_per_play": 5.0}, "games_count": 11},
     "talent": {"talent_composite": 710.0},
     "prior": {"offense": 0.4, "defense": 0.2}},
    {"team_id": 2, "name": "South",
     "preseason_baseline": {"off_yards_per_play": 5.2, "def_yards_per_play": 5.9}},
    {"team_id": 3}
  ],
  "game_stats": [
    {"game_id": 9, "team_id": 1, "season": 1999, "metrics": {"off_yards_per_play": 7.0}}
  ],
  "games": [
    {"game_id": 9, "season": 1999, "week": 1, "home_id": 1, "away_id": 2,
     "home_yards": 430.0, "away_yards": 310.0, "home_plays": 70, "away_plays": 64},
    {"game_id": 10, "season": 2022, "home_id": 3, "away_id": 1,
     "home_yards": null, "away_yards": null, "home_plays": null, "away_plays": null,
     "completed": false}
  ]
}"#;

#[test]
fn json_bundle_imports_onto_its_season() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("season.json");
    fs::write(&path, BUNDLE_JSON).unwrap();

    let bundle = read_bundle(&path).unwrap();
    let store = SqliteFeatureStore::open(&dir.path().join("features.sqlite")).unwrap();
    let summary = store.import_bundle(&bundle).unwrap();
    assert_eq!(summary.teams, 3);
    assert_eq!(summary.games, 2);

    let roster = store.roster(2022).unwrap();
    assert_eq!(roster.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);

    let agg = store.season_aggregate(1, 2022).unwrap().unwrap();
    assert_eq!(agg.games_count, 11);
    assert_eq!(agg.metrics.off_yards_per_play, Some(6.1));
    assert_eq!(store.prior_rating(1, 2022).unwrap().unwrap().offense, 0.4);
    assert!(store.preseason_baseline(2, 2022).unwrap().is_some());
    assert!(store.talent(3, 2022).unwrap().is_none());

    // Rows tagged with another season are rewritten onto the bundle's season.
    assert_eq!(store.team_game_stats(1, 2022).unwrap().len(), 1);
    assert!(store.team_game_stats(1, 1999).unwrap().is_empty());
    let games = store.games_for_team(1, 2022).unwrap();
    assert_eq!(games.len(), 2);
    assert!(games.iter().any(|g| g.game_id == 10 && !g.completed));
}

#[test]
fn reimport_is_idempotent() {
    let generated = synthetic::generate(
        2021,
        &SyntheticParams {
            teams: 8,
            weeks: 2,
            seed: 5,
        },
    );
    let store = SqliteFeatureStore::open_in_memory().unwrap();
    store.import_bundle(&generated.bundle).unwrap();
    store.import_bundle(&generated.bundle).unwrap();
    let roster = store.roster(2021).unwrap();
    assert_eq!(roster.len(), 8);
    assert_eq!(engine::load_games(&store, &roster, 2021).len(), 8);
}

fn rated(dir: &std::path::Path) -> (SqliteRatingStore, i64) {
    let generated = synthetic::generate(
        2024,
        &SyntheticParams {
            teams: 20,
            weeks: 10,
            seed: 9,
        },
    );
    let db = dir.join("ratings.sqlite");
    let features = SqliteFeatureStore::open(&db).unwrap();
    features.import_bundle(&generated.bundle).unwrap();
    let mut ratings = SqliteRatingStore::open(&db).unwrap();
    let mut config = ModelRegistry::builtin().resolve(DEFAULT_MODEL_VERSION).unwrap();
    config.calibration_factor = 7.5;
    let report = engine::run_season(2024, &config, &features, &mut ratings).unwrap();
    (ratings, report.run_id)
}

#[test]
fn csv_export_writes_ratings_and_stage_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let (ratings, run_id) = rated(dir.path());
    let stored = ratings.read_back(2024, DEFAULT_MODEL_VERSION).unwrap();
    let stages = ratings.stage_stats(run_id).unwrap();
    let run = ratings.run(run_id).unwrap();

    let out = dir.path().join("audit.csv");
    let report = export_audit(&out, &stored, &stages, run.as_ref()).unwrap();
    assert_eq!(report.ratings, 20);
    assert_eq!(report.stages, stages.len());
    assert_eq!(report.files.len(), 2);

    let body = fs::read_to_string(&out).unwrap();
    let mut lines = body.lines();
    assert!(lines.next().unwrap().starts_with("rank,team_id,power_rating"));
    assert!(lines.next().unwrap().starts_with("1,"));
    assert_eq!(body.lines().count(), 21);

    let stage_body = fs::read_to_string(dir.path().join("audit_stages.csv")).unwrap();
    assert!(stage_body.contains("raw baseline"));
    assert!(stage_body.contains("readback"));
}

#[test]
fn xlsx_export_produces_a_workbook() {
    let dir = tempfile::tempdir().unwrap();
    let (ratings, run_id) = rated(dir.path());
    let stored = ratings.read_back(2024, DEFAULT_MODEL_VERSION).unwrap();
    let stages = ratings.stage_stats(run_id).unwrap();

    let out = dir.path().join("audit.xlsx");
    let report = export_audit(&out, &stored, &stages, None).unwrap();
    assert_eq!(report.files, vec![out.clone()]);
    assert!(fs::metadata(&out).unwrap().len() > 0);
}
