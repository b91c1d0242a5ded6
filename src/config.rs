use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use anyhow::Context;
use chrono::{Datelike, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::calibration;
use crate::error::EngineError;
use crate::feature_loader::LoaderParams;
use crate::index_composer::IndexWeights;
use crate::sanity_gates::GateParams;
use crate::shrinkage::{GamesStep, ShrinkageParams};
use crate::sos::SosParams;
use crate::team_features::{Metric, MetricGroup};

pub const DEFAULT_MODEL_VERSION: &str = "default";
pub const DEFAULT_HOME_FIELD_ADVANTAGE: f64 = 2.5;
pub const MIN_SEASON: i32 = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct RosterParams {
    /// When set, the run aborts unless `found / expected_size >= min_coverage`.
    pub expected_size: Option<usize>,
    pub min_coverage: f64,
}

impl Default for RosterParams {
    fn default() -> Self {
        Self {
            expected_size: None,
            min_coverage: 0.95,
        }
    }
}

/// Fully resolved parameters for one model version.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub version: String,
    pub weights: IndexWeights,
    pub home_field_advantage: f64,
    pub sos: SosParams,
    pub shrinkage: ShrinkageParams,
    pub calibration_factor: f64,
    pub gates: GateParams,
    pub loader: LoaderParams,
    pub roster: RosterParams,
}

/// Command-line adjustments applied on top of a resolved [`ModelConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub sos_weight: Option<f64>,
    pub shrinkage_base: Option<f64>,
    pub calibration_factor: Option<f64>,
    pub expected_roster_size: Option<usize>,
}

impl ModelConfig {
    pub fn apply(&mut self, overrides: &ConfigOverrides) -> Result<(), EngineError> {
        if let Some(w) = overrides.sos_weight {
            info!(model_version = %self.version, sos_weight = w, "override");
            self.sos.weight = w;
        }
        if let Some(b) = overrides.shrinkage_base {
            info!(model_version = %self.version, shrinkage_base = b, "override");
            self.shrinkage.base = b;
        }
        if let Some(c) = overrides.calibration_factor {
            self.calibration_factor = calibration::resolve_factor(Some(c), &self.version);
        }
        if let Some(n) = overrides.expected_roster_size {
            self.roster.expected_size = Some(n);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |msg: String| Err(EngineError::InvalidConfig(format!("{}: {msg}", self.version)));
        if !self.home_field_advantage.is_finite() {
            return bad("home_field_advantage must be finite".into());
        }
        if !(self.sos.weight.is_finite() && self.sos.weight >= 0.0) {
            return bad(format!("sos.weight must be a non-negative number, got {}", self.sos.weight));
        }
        if !(self.sos.convergence_threshold > 0.0) {
            return bad("sos.convergence_threshold must be positive".into());
        }
        let s = &self.shrinkage;
        if !(0.0..=1.0).contains(&s.min) || !(0.0..=1.0).contains(&s.max) || s.min > s.max {
            return bad(format!("shrinkage band [{}, {}] must sit inside [0, 1]", s.min, s.max));
        }
        if !s.base.is_finite() || !s.confidence_weight.is_finite() || !s.confidence_cap.is_finite() {
            return bad("shrinkage terms must be finite".into());
        }
        if !(self.roster.min_coverage > 0.0 && self.roster.min_coverage <= 1.0) {
            return bad(format!("roster.min_coverage must be in (0, 1], got {}", self.roster.min_coverage));
        }
        if !(self.gates.min_stddev >= 0.0 && self.gates.max_zero_fraction > 0.0) {
            return bad("gate thresholds must be positive".into());
        }
        for group in [MetricGroup::Offense, MetricGroup::Defense, MetricGroup::Talent] {
            if let Some((metric, w)) = self.weights.for_group(group).iter().find(|(_, w)| !w.is_finite()) {
                return bad(format!("weight for {} is not finite: {w}", metric.key()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigFile {
    #[serde(default)]
    models: BTreeMap<String, RawModelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModelConfig {
    home_field_advantage: Option<f64>,
    calibration_factor: Option<f64>,
    weights: Option<RawWeights>,
    sos: Option<RawSos>,
    shrinkage: Option<RawShrinkage>,
    gates: Option<RawGates>,
    loader: Option<RawLoader>,
    roster: Option<RawRoster>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWeights {
    offense: Option<BTreeMap<String, f64>>,
    defense: Option<BTreeMap<String, f64>>,
    talent: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSos {
    enabled: Option<bool>,
    max_iterations: Option<usize>,
    convergence_threshold: Option<f64>,
    weight: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawShrinkage {
    base: Option<f64>,
    confidence_weight: Option<f64>,
    confidence_cap: Option<f64>,
    games_steps: Option<Vec<GamesStep>>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGates {
    min_stddev: Option<f64>,
    max_zero_fraction: Option<f64>,
    integrity_tolerance: Option<f64>,
    top_n: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoader {
    min_game_level_games: Option<u32>,
    full_confidence_games: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRoster {
    expected_size: Option<usize>,
    min_coverage: Option<f64>,
}

/// Fills absent fields with their default and says so.
struct Defaulter<'a> {
    version: &'a str,
}

impl Defaulter<'_> {
    fn take<T: Debug>(&self, field: &str, value: Option<T>, default: T) -> T {
        match value {
            Some(v) => v,
            None => {
                warn!(model_version = self.version, field, default = ?default, "config field not set; using default");
                default
            }
        }
    }
}

/// Model versions available to a run: a TOML file's entries plus the built-in `default`.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, RawModelConfig>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let file: RawConfigFile =
            toml::from_str(raw).map_err(|e| EngineError::InvalidConfig(format!("parse model config: {e}")))?;
        Ok(Self { models: file.models })
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read model config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn versions(&self) -> Vec<String> {
        let mut out: Vec<String> = self.models.keys().cloned().collect();
        if !self.models.contains_key(DEFAULT_MODEL_VERSION) {
            out.push(DEFAULT_MODEL_VERSION.to_string());
        }
        out
    }

    /// Fails with `MissingModelConfig` for an unknown version; nothing is computed after that.
    pub fn resolve(&self, version: &str) -> Result<ModelConfig, EngineError> {
        let config = match self.models.get(version) {
            Some(raw) => resolve_raw(version, raw)?,
            None if version == DEFAULT_MODEL_VERSION => builtin_default(),
            None => return Err(EngineError::MissingModelConfig(version.to_string())),
        };
        config.validate()?;
        Ok(config)
    }
}

fn builtin_default() -> ModelConfig {
    info!(model_version = DEFAULT_MODEL_VERSION, "using built-in model configuration");
    ModelConfig {
        version: DEFAULT_MODEL_VERSION.to_string(),
        weights: IndexWeights::default(),
        home_field_advantage: DEFAULT_HOME_FIELD_ADVANTAGE,
        sos: SosParams::default(),
        shrinkage: ShrinkageParams::default(),
        calibration_factor: calibration::resolve_factor(None, DEFAULT_MODEL_VERSION),
        gates: GateParams::default(),
        loader: LoaderParams::default(),
        roster: RosterParams::default(),
    }
}

fn resolve_raw(version: &str, raw: &RawModelConfig) -> Result<ModelConfig, EngineError> {
    let d = Defaulter { version };
    let weights = resolve_weights(&d, raw.weights.clone().unwrap_or_default())?;

    let sos_raw = raw.sos.clone().unwrap_or_default();
    let sos_default = SosParams::default();
    let sos = SosParams {
        enabled: d.take("sos.enabled", sos_raw.enabled, sos_default.enabled),
        max_iterations: d.take("sos.max_iterations", sos_raw.max_iterations, sos_default.max_iterations),
        convergence_threshold: d.take(
            "sos.convergence_threshold",
            sos_raw.convergence_threshold,
            sos_default.convergence_threshold,
        ),
        weight: d.take("sos.weight", sos_raw.weight, sos_default.weight),
    };

    let sh_raw = raw.shrinkage.clone().unwrap_or_default();
    let sh_default = ShrinkageParams::default();
    let mut games_steps = d.take("shrinkage.games_steps", sh_raw.games_steps, sh_default.games_steps);
    games_steps.sort_by_key(|s| s.below_games);
    let shrinkage = ShrinkageParams {
        base: d.take("shrinkage.base", sh_raw.base, sh_default.base),
        confidence_weight: d.take(
            "shrinkage.confidence_weight",
            sh_raw.confidence_weight,
            sh_default.confidence_weight,
        ),
        confidence_cap: d.take("shrinkage.confidence_cap", sh_raw.confidence_cap, sh_default.confidence_cap),
        games_steps,
        min: d.take("shrinkage.min", sh_raw.min, sh_default.min),
        max: d.take("shrinkage.max", sh_raw.max, sh_default.max),
    };

    let g_raw = raw.gates.clone().unwrap_or_default();
    let g_default = GateParams::default();
    let gates = GateParams {
        min_stddev: d.take("gates.min_stddev", g_raw.min_stddev, g_default.min_stddev),
        max_zero_fraction: d.take("gates.max_zero_fraction", g_raw.max_zero_fraction, g_default.max_zero_fraction),
        integrity_tolerance: d.take(
            "gates.integrity_tolerance",
            g_raw.integrity_tolerance,
            g_default.integrity_tolerance,
        ),
        top_n: d.take("gates.top_n", g_raw.top_n, g_default.top_n),
    };

    let l_raw = raw.loader.clone().unwrap_or_default();
    let l_default = LoaderParams::default();
    let loader = LoaderParams {
        min_game_level_games: d.take(
            "loader.min_game_level_games",
            l_raw.min_game_level_games,
            l_default.min_game_level_games,
        ),
        full_confidence_games: d.take(
            "loader.full_confidence_games",
            l_raw.full_confidence_games,
            l_default.full_confidence_games,
        ),
    };

    let r_raw = raw.roster.clone().unwrap_or_default();
    let roster = RosterParams {
        expected_size: r_raw.expected_size,
        min_coverage: d.take("roster.min_coverage", r_raw.min_coverage, RosterParams::default().min_coverage),
    };

    Ok(ModelConfig {
        version: version.to_string(),
        weights,
        home_field_advantage: d.take(
            "home_field_advantage",
            raw.home_field_advantage,
            DEFAULT_HOME_FIELD_ADVANTAGE,
        ),
        sos,
        shrinkage,
        calibration_factor: calibration::resolve_factor(raw.calibration_factor, version),
        gates,
        loader,
        roster,
    })
}

fn resolve_weights(d: &Defaulter<'_>, raw: RawWeights) -> Result<IndexWeights, EngineError> {
    let defaults = IndexWeights::default();
    Ok(IndexWeights {
        offense: resolve_group(d, "weights.offense", raw.offense, MetricGroup::Offense, defaults.offense)?,
        defense: resolve_group(d, "weights.defense", raw.defense, MetricGroup::Defense, defaults.defense)?,
        talent: resolve_group(d, "weights.talent", raw.talent, MetricGroup::Talent, defaults.talent)?,
    })
}

fn resolve_group(
    d: &Defaulter<'_>,
    field: &str,
    raw: Option<BTreeMap<String, f64>>,
    group: MetricGroup,
    default: BTreeMap<Metric, f64>,
) -> Result<BTreeMap<Metric, f64>, EngineError> {
    let Some(table) = raw else {
        return Ok(d.take(field, None, default));
    };
    let mut out = BTreeMap::new();
    for (key, weight) in table {
        let metric = Metric::from_key(&key)
            .ok_or_else(|| EngineError::InvalidConfig(format!("{}: unknown metric `{key}` in {field}", d.version)))?;
        if metric.group() != group {
            return Err(EngineError::InvalidConfig(format!(
                "{}: metric `{key}` does not belong in {field}",
                d.version
            )));
        }
        out.insert(metric, weight);
    }
    Ok(out)
}

/// Seasons from 2000 through next year are accepted.
pub fn validate_season(season: i32) -> Result<(), EngineError> {
    let max = Utc::now().year() + 1;
    if (MIN_SEASON..=max).contains(&season) {
        Ok(())
    } else {
        Err(EngineError::InvalidSeason {
            season,
            min: MIN_SEASON,
            max,
        })
    }
}

/// An empty roster never passes; a short one fails only when an expected size is configured.
pub fn check_roster_coverage(found: usize, params: &RosterParams) -> Result<(), EngineError> {
    let expected = params.expected_size.unwrap_or(found);
    let short = match params.expected_size {
        _ if found == 0 => true,
        Some(0) | None => false,
        Some(e) => (found as f64 / e as f64) < params.min_coverage,
    };
    if short {
        return Err(EngineError::RosterCoverage {
            found,
            expected,
            min_coverage: params.min_coverage,
        });
    }
    Ok(())
}
