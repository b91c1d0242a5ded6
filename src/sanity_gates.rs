use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::team_features::TeamId;
use crate::zscore::population_stats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateParams {
    /// Gate A: power-rating stddev must exceed this.
    pub min_stddev: f64,
    /// Gate B: share of exactly-zero power ratings must stay below this.
    pub max_zero_fraction: f64,
    /// Allowed |pre-write stddev − read-back stddev|.
    pub integrity_tolerance: f64,
    pub top_n: usize,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            min_stddev: 0.5,
            max_zero_fraction: 0.02,
            integrity_tolerance: 1e-6,
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    DistributionCollapse { stddev: f64, floor: f64 },
    TooManyZeros { fraction: f64, ceiling: f64 },
    IntegrityMismatch { pre_write: f64, readback: f64, tolerance: f64 },
    CountMismatch { expected: usize, readback: usize },
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailure::DistributionCollapse { stddev, floor } => {
                write!(f, "gate A: power stddev {stddev:.6} is not above floor {floor:.6}")
            }
            GateFailure::TooManyZeros { fraction, ceiling } => write!(
                f,
                "gate B: {:.2}% of ratings are exactly zero (ceiling {:.2}%)",
                fraction * 100.0,
                ceiling * 100.0
            ),
            GateFailure::IntegrityMismatch {
                pre_write,
                readback,
                tolerance,
            } => write!(
                f,
                "integrity: read-back stddev {readback:.9} differs from pre-write {pre_write:.9} by more than {tolerance:e}"
            ),
            GateFailure::CountMismatch { expected, readback } => write!(
                f,
                "integrity: wrote {expected} ratings but read back {readback}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub stddev: f64,
    pub zero_fraction: f64,
    pub failures: Vec<GateFailure>,
    /// Largest |power| first.
    pub offenders: Vec<(TeamId, f64)>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for GateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msgs: Vec<String> = self.failures.iter().map(|g| g.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Gate A (spread floor) and Gate B (zero ceiling) over a set of power ratings.
pub fn check_distribution(ratings: &[(TeamId, f64)], params: &GateParams) -> GateReport {
    let values: Vec<f64> = ratings.iter().map(|(_, v)| *v).collect();
    let stddev = population_stats(&values).stddev;
    let zeros = values.iter().filter(|v| **v == 0.0).count();
    let zero_fraction = if values.is_empty() {
        1.0
    } else {
        zeros as f64 / values.len() as f64
    };

    let mut failures = Vec::new();
    if !(stddev > params.min_stddev) {
        failures.push(GateFailure::DistributionCollapse {
            stddev,
            floor: params.min_stddev,
        });
    }
    if !(zero_fraction < params.max_zero_fraction) {
        failures.push(GateFailure::TooManyZeros {
            fraction: zero_fraction,
            ceiling: params.max_zero_fraction,
        });
    }

    GateReport {
        stddev,
        zero_fraction,
        failures,
        offenders: top_offenders(ratings, params.top_n),
    }
}

/// Read-after-write check: the persisted distribution must match what was computed.
pub fn check_integrity(
    pre_write: &[(TeamId, f64)],
    readback: &[(TeamId, f64)],
    params: &GateParams,
) -> Vec<GateFailure> {
    let mut failures = Vec::new();
    if pre_write.len() != readback.len() {
        failures.push(GateFailure::CountMismatch {
            expected: pre_write.len(),
            readback: readback.len(),
        });
    }
    let pre: Vec<f64> = pre_write.iter().map(|(_, v)| *v).collect();
    let back: Vec<f64> = readback.iter().map(|(_, v)| *v).collect();
    let pre_sd = population_stats(&pre).stddev;
    let back_sd = population_stats(&back).stddev;
    if !((pre_sd - back_sd).abs() <= params.integrity_tolerance) {
        failures.push(GateFailure::IntegrityMismatch {
            pre_write: pre_sd,
            readback: back_sd,
            tolerance: params.integrity_tolerance,
        });
    }
    failures
}

/// All three gates against the read-back ratings.
pub fn run_gates(
    pre_write: &[(TeamId, f64)],
    readback: &[(TeamId, f64)],
    params: &GateParams,
) -> GateReport {
    let mut report = check_distribution(readback, params);
    report.failures.extend(check_integrity(pre_write, readback, params));
    if report.passed() {
        info!(
            stddev = report.stddev,
            zero_fraction = report.zero_fraction,
            "sanity gates passed"
        );
    } else {
        for failure in &report.failures {
            error!("{failure}");
        }
        for (rank, (team_id, power)) in report.offenders.iter().enumerate() {
            error!(rank = rank + 1, team_id, power, "extreme rating");
        }
    }
    report
}

pub fn top_offenders(ratings: &[(TeamId, f64)], n: usize) -> Vec<(TeamId, f64)> {
    let mut sorted = ratings.to_vec();
    sorted.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    sorted.truncate(n);
    sorted
}
