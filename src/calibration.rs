use tracing::warn;

pub const DEFAULT_CALIBRATION_FACTOR: f64 = 1.0;

/// Resolve the configured factor, shouting when it is absent because it rescales every rating.
pub fn resolve_factor(configured: Option<f64>, model_version: &str) -> f64 {
    match configured {
        Some(f) if f.is_finite() && f != 0.0 => f,
        Some(f) => {
            warn!(
                model_version,
                configured = f,
                "CALIBRATION FACTOR IS NOT USABLE; falling back to {DEFAULT_CALIBRATION_FACTOR}. Ratings stay in z-score units"
            );
            DEFAULT_CALIBRATION_FACTOR
        }
        None => {
            warn!(
                model_version,
                "CALIBRATION FACTOR MISSING; defaulting to {DEFAULT_CALIBRATION_FACTOR}. Ratings stay in z-score units"
            );
            DEFAULT_CALIBRATION_FACTOR
        }
    }
}

/// Map a z-score-space composite into point-spread units.
pub fn calibrate(composite: f64, factor: f64) -> f64 {
    composite * factor
}

/// Home-minus-away spread in points. Positive favours the home side.
pub fn implied_spread(home_power: f64, away_power: f64, home_field_advantage: f64, neutral_site: bool) -> f64 {
    let hfa = if neutral_site { 0.0 } else { home_field_advantage };
    home_power - away_power + hfa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_factor_defaults_to_one() {
        assert_eq!(resolve_factor(None, "v1"), 1.0);
        assert_eq!(resolve_factor(Some(f64::NAN), "v1"), 1.0);
        assert_eq!(resolve_factor(Some(7.5), "v1"), 7.5);
    }

    #[test]
    fn calibration_is_a_pure_scale() {
        assert!((calibrate(1.2, 7.5) - 9.0).abs() < 1e-12);
        assert_eq!(calibrate(-2.0, 1.0), -2.0);
    }

    #[test]
    fn neutral_site_drops_home_field() {
        assert!((implied_spread(10.0, 4.0, 2.5, false) - 8.5).abs() < 1e-12);
        assert!((implied_spread(10.0, 4.0, 2.5, true) - 6.0).abs() < 1e-12);
    }
}
