use thiserror::Error;

use crate::sanity_gates::GateReport;

/// Conditions that make a whole rating run untrustworthy.
/// Single-team problems never surface here; they are recovered and counted.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no model configuration for version `{0}`")]
    MissingModelConfig(String),

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("season {season} is outside the supported range {min}..={max}")]
    InvalidSeason { season: i32, min: i32, max: i32 },

    #[error("roster coverage {found}/{expected} is below the required {:.0}%", .min_coverage * 100.0)]
    RosterCoverage {
        found: usize,
        expected: usize,
        min_coverage: f64,
    },

    #[error("sanity gates failed for run {run_id}: {report}")]
    SanityGate { run_id: i64, report: GateReport },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
