use serde::{Deserialize, Serialize};
use tracing::info;

use crate::zscore::population_stats;

/// Distribution snapshot of one pipeline stage's power ratings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: String,
    pub count: usize,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub zero_count: usize,
    pub zero_pct: f64,
}

impl StageStats {
    pub fn from_values(stage: impl Into<String>, values: &[f64]) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let pop = population_stats(&finite);
        let zero_count = values.iter().filter(|v| **v == 0.0).count();
        let (min, max) = if finite.is_empty() {
            (0.0, 0.0)
        } else {
            finite
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
        };
        Self {
            stage: stage.into(),
            count: values.len(),
            mean: pop.mean,
            stddev: pop.stddev,
            min,
            max,
            zero_count,
            zero_pct: if values.is_empty() {
                0.0
            } else {
                zero_count as f64 / values.len() as f64
            },
        }
    }

    pub const HEADER: [&'static str; 8] = [
        "Stage", "Count", "Mean", "StdDev", "Min", "Max", "Zero Count", "Zero %",
    ];

    pub fn row(&self) -> Vec<String> {
        vec![
            self.stage.clone(),
            self.count.to_string(),
            format!("{:.6}", self.mean),
            format!("{:.6}", self.stddev),
            format!("{:.6}", self.min),
            format!("{:.6}", self.max),
            self.zero_count.to_string(),
            format!("{:.4}", self.zero_pct * 100.0),
        ]
    }
}

/// Ordered, append-only record of stage snapshots for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationLog {
    entries: Vec<StageStats>,
}

impl InstrumentationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: impl Into<String>, values: &[f64]) -> &StageStats {
        let stats = StageStats::from_values(stage, values);
        info!(
            stage = %stats.stage,
            count = stats.count,
            mean = stats.mean,
            stddev = stats.stddev,
            min = stats.min,
            max = stats.max,
            zero_pct = stats.zero_pct,
            "stage stats"
        );
        self.entries.push(stats);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[StageStats] {
        &self.entries
    }

    pub fn get(&self, stage: &str) -> Option<&StageStats> {
        self.entries.iter().rev().find(|s| s.stage == stage)
    }

    /// Header row followed by one row per stage, in recording order.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        let mut rows = vec![StageStats::HEADER.iter().map(|s| s.to_string()).collect()];
        rows.extend(self.entries.iter().map(StageStats::row));
        rows
    }
}

pub mod stage {
    pub const RAW_BASELINE: &str = "raw baseline";
    pub const PRE_SHRINKAGE: &str = "pre-shrinkage";
    pub const POST_SHRINKAGE: &str = "post-shrinkage";
    pub const POST_CALIBRATION: &str = "post-calibration";
    pub const READBACK: &str = "readback";

    pub fn sos_iteration(n: usize) -> String {
        format!("SoS iteration {n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_capture_zero_share_and_range() {
        let s = StageStats::from_values("x", &[0.0, 2.0, -2.0, 0.0]);
        assert_eq!(s.count, 4);
        assert_eq!(s.zero_count, 2);
        assert!((s.zero_pct - 0.5).abs() < 1e-12);
        assert_eq!(s.min, -2.0);
        assert_eq!(s.max, 2.0);
        assert!((s.stddev - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn log_keeps_recording_order() {
        let mut log = InstrumentationLog::new();
        log.record(stage::RAW_BASELINE, &[1.0, 2.0]);
        log.record(stage::sos_iteration(1), &[1.0, 3.0]);
        log.record(stage::POST_CALIBRATION, &[5.0]);
        let names: Vec<&str> = log.entries().iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["raw baseline", "SoS iteration 1", "post-calibration"]);
        assert_eq!(log.to_rows().len(), 4);
        assert_eq!(log.get("SoS iteration 1").map(|s| s.count), Some(2));
    }

    #[test]
    fn empty_stage_is_all_zeroes() {
        let s = StageStats::from_values("empty", &[]);
        assert_eq!(s.count, 0);
        assert_eq!(s.min, 0.0);
        assert_eq!(s.zero_pct, 0.0);
    }
}
