use serde::{Deserialize, Serialize};

/// `below_games` is exclusive: a team with fewer games than this gets `term`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GamesStep {
    pub below_games: u32,
    pub term: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkageParams {
    pub base: f64,
    pub confidence_weight: f64,
    pub confidence_cap: f64,
    pub games_steps: Vec<GamesStep>,
    pub min: f64,
    pub max: f64,
}

impl Default for ShrinkageParams {
    fn default() -> Self {
        Self {
            base: 0.12,
            confidence_weight: 0.5,
            confidence_cap: 0.15,
            games_steps: vec![
                GamesStep { below_games: 3, term: 0.18 },
                GamesStep { below_games: 6, term: 0.10 },
                GamesStep { below_games: 9, term: 0.05 },
            ],
            min: 0.18,
            max: 0.42,
        }
    }
}

impl ShrinkageParams {
    /// Additive term from the first step whose threshold the team has not reached.
    pub fn games_term(&self, games: u32) -> f64 {
        let mut steps = self.games_steps.clone();
        steps.sort_by_key(|s| s.below_games);
        steps
            .iter()
            .find(|s| games < s.below_games)
            .map(|s| s.term)
            .unwrap_or(0.0)
    }

    pub fn confidence_term(&self, confidence: f64) -> f64 {
        let c = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        ((1.0 - c) * self.confidence_weight).min(self.confidence_cap)
    }

    /// Per-team λ, clamped into `[min, max]`.
    pub fn factor(&self, confidence: f64, games: u32) -> f64 {
        let raw = self.base + self.confidence_term(confidence) + self.games_term(games);
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        raw.max(lo).min(hi).clamp(0.0, 1.0)
    }
}

/// `(1 − λ)·raw + λ·prior`, with λ clamped to `[0, 1]`.
pub fn shrink(raw: f64, prior: f64, lambda: f64) -> f64 {
    let l = lambda.clamp(0.0, 1.0);
    if l == 0.0 {
        return raw;
    }
    if l == 1.0 {
        return prior;
    }
    (1.0 - l) * raw + l * prior
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_boundaries_return_inputs_exactly() {
        for (x, p) in [(3.7, -1.2), (-1e9, 4.0), (0.0, 0.0), (1e-12, 7.5)] {
            assert_eq!(shrink(x, p, 0.0), x);
            assert_eq!(shrink(x, p, 1.0), p);
        }
    }

    #[test]
    fn shrink_blends_linearly() {
        assert!((shrink(10.0, 0.0, 0.25) - 7.5).abs() < 1e-12);
    }

    #[test]
    fn early_season_low_confidence_team_hits_the_ceiling() {
        let params = ShrinkageParams::default();
        let expected = (0.12_f64 + (0.7_f64 * 0.5).min(0.15) + 0.18).max(0.18).min(0.42);
        let got = params.factor(0.3, 2);
        assert!((got - expected).abs() < 1e-12);
        assert!((got - 0.42).abs() < 1e-12);
    }

    #[test]
    fn games_term_reaches_zero_past_threshold() {
        let params = ShrinkageParams::default();
        assert_eq!(params.games_term(0), 0.18);
        assert_eq!(params.games_term(3), 0.10);
        assert_eq!(params.games_term(8), 0.05);
        assert_eq!(params.games_term(9), 0.0);
        assert_eq!(params.games_term(14), 0.0);
    }

    #[test]
    fn full_season_confident_team_hits_the_floor() {
        let params = ShrinkageParams::default();
        assert!((params.factor(1.0, 12) - 0.18).abs() < 1e-12);
    }
}
