use std::fs;

use cfb_ratings::config::{DEFAULT_MODEL_VERSION, ModelRegistry};
use cfb_ratings::error::EngineError;
use cfb_ratings::team_features::Metric;

const CONFIG: &str = r#"
[models.power_v3]
calibration_factor = 6.8

[models.power_v3.weights.offense]
off_epa_per_play = 0.6
off_success_rate = 0.4

[models.power_v3.weights.defense]
def_epa_per_play = 1.0

[models.power_v3.weights.talent]
talent_composite = 0.25

[models.power_v3.shrinkage]
base = 0.10
games_steps = [
  { below_games = 4, term = 0.20 },
  { below_games = 8, term = 0.08 },
]

[models.power_v3.gates]
min_stddev = 1.5
top_n = 5
"#;

#[test]
fn registry_loads_versions_from_a_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.toml");
    fs::write(&path, CONFIG).unwrap();

    let registry = ModelRegistry::from_file(&path).unwrap();
    assert_eq!(registry.versions(), vec!["power_v3".to_string(), DEFAULT_MODEL_VERSION.to_string()]);

    let cfg = registry.resolve("power_v3").unwrap();
    assert_eq!(cfg.calibration_factor, 6.8);
    assert_eq!(cfg.weights.offense.get(&Metric::OffEpaPerPlay), Some(&0.6));
    assert!(cfg.weights.offense.get(&Metric::OffYardsPerPlay).is_none());
    assert_eq!(cfg.weights.talent.len(), 1);
    assert_eq!(cfg.shrinkage.base, 0.10);
    assert_eq!(cfg.shrinkage.games_term(3), 0.20);
    assert_eq!(cfg.shrinkage.games_term(7), 0.08);
    assert_eq!(cfg.shrinkage.games_term(8), 0.0);
    assert_eq!(cfg.gates.min_stddev, 1.5);
    assert_eq!(cfg.gates.top_n, 5);
    assert_eq!(cfg.gates.max_zero_fraction, 0.02);
    assert_eq!(cfg.home_field_advantage, 2.5);
}

#[test]
fn missing_file_and_typos_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ModelRegistry::from_file(&dir.path().join("absent.toml")),
        Err(EngineError::Store(_))
    ));

    let typo = "[models.v1.sos]\nwieght = 0.1\n";
    assert!(matches!(
        ModelRegistry::from_toml_str(typo),
        Err(EngineError::InvalidConfig(_))
    ));
}

#[test]
fn inverted_shrinkage_band_is_invalid() {
    let raw = "[models.v1.shrinkage]\nmin = 0.5\nmax = 0.2\n";
    let registry = ModelRegistry::from_toml_str(raw).unwrap();
    assert!(matches!(registry.resolve("v1"), Err(EngineError::InvalidConfig(_))));
}
