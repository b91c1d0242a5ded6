use std::collections::BTreeMap;

use crate::team_features::{Metric, MetricGroup, TeamFeatures};

/// Below this the population is treated as having no spread.
const STDDEV_EPSILON: f64 = 1e-9;

/// Population mean/stddev for a single metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZScoreStats {
    pub mean: f64,
    pub stddev: f64,
    pub count: usize,
}

impl ZScoreStats {
    pub const EMPTY: ZScoreStats = ZScoreStats {
        mean: 0.0,
        stddev: 0.0,
        count: 0,
    };

    /// Null values sit at the mean, and a flat population yields 0 for everyone.
    pub fn z(&self, value: Option<f64>) -> f64 {
        let Some(v) = value else {
            return 0.0;
        };
        if self.stddev < STDDEV_EPSILON || !v.is_finite() {
            return 0.0;
        }
        let z = (v - self.mean) / self.stddev;
        if z.is_finite() { z } else { 0.0 }
    }
}

/// Population statistics over every team with a non-null, finite value.
/// Fewer than two samples means no variance.
pub fn z_scores<F>(features: &[TeamFeatures], selector: F) -> ZScoreStats
where
    F: Fn(&TeamFeatures) -> Option<f64>,
{
    let values: Vec<f64> = features
        .iter()
        .filter_map(|f| selector(f))
        .filter(|v| v.is_finite())
        .collect();
    population_stats(&values)
}

pub fn population_stats(values: &[f64]) -> ZScoreStats {
    if values.is_empty() {
        return ZScoreStats::EMPTY;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return ZScoreStats {
            mean,
            stddev: 0.0,
            count: values.len(),
        };
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = var.sqrt();
    ZScoreStats {
        mean,
        stddev: if stddev < STDDEV_EPSILON { 0.0 } else { stddev },
        count: values.len(),
    }
}

/// Stats for every metric in the given groups, recomputed from `features` each call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZScoreTable {
    stats: BTreeMap<Metric, ZScoreStats>,
}

impl ZScoreTable {
    pub fn compute(features: &[TeamFeatures], groups: &[MetricGroup]) -> Self {
        let stats = groups
            .iter()
            .flat_map(|g| Metric::in_group(*g))
            .map(|m| (m, z_scores(features, |f| f.metric(m))))
            .collect();
        Self { stats }
    }

    pub fn get(&self, metric: Metric) -> ZScoreStats {
        self.stats.get(&metric).copied().unwrap_or(ZScoreStats::EMPTY)
    }

    pub fn z(&self, features: &TeamFeatures, metric: Metric) -> f64 {
        self.get(metric).z(features.metric(metric))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Metric, &ZScoreStats)> {
        self.stats.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team_features::TeamFeatures;

    fn with_ypp(id: u32, ypp: Option<f64>) -> TeamFeatures {
        let mut f = TeamFeatures::missing(id, 2024);
        f.performance.off_yards_per_play = ypp;
        f
    }

    #[test]
    fn nulls_are_excluded_and_sit_at_the_mean() {
        let teams = vec![with_ypp(1, Some(4.0)), with_ypp(2, Some(6.0)), with_ypp(3, None)];
        let stats = z_scores(&teams, |f| f.performance.off_yards_per_play);
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.stddev - 1.0).abs() < 1e-12);
        assert_eq!(stats.z(None), 0.0);
        assert!((stats.z(Some(6.0)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn single_sample_has_no_variance() {
        let teams = vec![with_ypp(1, Some(4.0)), with_ypp(2, None)];
        let stats = z_scores(&teams, |f| f.performance.off_yards_per_play);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.z(Some(100.0)), 0.0);
    }

    #[test]
    fn flat_population_never_divides_by_zero() {
        let teams = vec![with_ypp(1, Some(5.0)), with_ypp(2, Some(5.0)), with_ypp(3, Some(5.0))];
        let stats = z_scores(&teams, |f| f.performance.off_yards_per_play);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.z(Some(5.0)), 0.0);
        assert!(stats.z(Some(7.0)).is_finite());
    }

    #[test]
    fn repeated_calls_are_identical() {
        let teams = vec![with_ypp(1, Some(4.2)), with_ypp(2, Some(6.9)), with_ypp(3, Some(5.1))];
        let a = z_scores(&teams, |f| f.performance.off_yards_per_play);
        let b = z_scores(&teams, |f| f.performance.off_yards_per_play);
        assert_eq!(a, b);
    }
}
