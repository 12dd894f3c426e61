//! Win/draw/loss accumulation and Elo estimates.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Two-sided 95% normal quantile.
const Z_95: f64 = 1.959_963_984_540_054;

/// Result of one game from one engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerResult {
    Win,
    Draw,
    Loss,
}

/// Win/draw/loss counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wdl {
    pub wins: u64,
    pub draws: u64,
    pub losses: u64,
}

impl Wdl {
    pub fn add(&mut self, result: PlayerResult) {
        match result {
            PlayerResult::Win => self.wins += 1,
            PlayerResult::Draw => self.draws += 1,
            PlayerResult::Loss => self.losses += 1,
        }
    }

    /// Same games seen from the other side.
    pub fn flipped(self) -> Wdl {
        Wdl {
            wins: self.losses,
            draws: self.draws,
            losses: self.wins,
        }
    }

    pub fn merged(self, other: Wdl) -> Wdl {
        Wdl {
            wins: self.wins + other.wins,
            draws: self.draws + other.draws,
            losses: self.losses + other.losses,
        }
    }

    pub fn games(&self) -> u64 {
        self.wins + self.draws + self.losses
    }

    /// Score fraction `(wins + draws / 2) / games`, `None` without games.
    pub fn score(&self) -> Option<f64> {
        let n = self.games();
        (n > 0).then(|| (self.wins as f64 + 0.5 * self.draws as f64) / n as f64)
    }
}

impl Display for Wdl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ={} -{}", self.wins, self.draws, self.losses)
    }
}

/// Elo difference implied by score fraction `p`: `400 * log10(p / (1 - p))`.
///
/// Diverges to `+inf` at `p = 1` and `-inf` at `p = 0`.
pub fn elo_from_score(p: f64) -> f64 {
    if p >= 1.0 {
        f64::INFINITY
    } else if p <= 0.0 {
        f64::NEG_INFINITY
    } else {
        400.0 * (p / (1.0 - p)).log10()
    }
}

/// Expected score fraction at an Elo difference, inverse of [`elo_from_score`].
pub fn score_from_elo(elo: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-elo / 400.0))
}

/// Point estimate and 95% confidence interval of an Elo difference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EloEstimate {
    pub elo: f64,
    pub lower: f64,
    pub upper: f64,
    pub games: u64,
    /// Score fraction.
    pub score: f64,
    pub draw_ratio: f64,
}

impl EloEstimate {
    /// Estimate from counts, `None` without games.
    ///
    /// The interval comes from the trinomial variance of the per-game score.
    pub fn from_wdl(wdl: &Wdl) -> Option<EloEstimate> {
        let p = wdl.score()?;
        let n = wdl.games() as f64;
        let (w, d, l) = (wdl.wins as f64, wdl.draws as f64, wdl.losses as f64);

        let variance =
            (w * (1.0 - p).powi(2) + d * (0.5 - p).powi(2) + l * (0.0 - p).powi(2)) / n;
        let margin = Z_95 * (variance / n).sqrt();

        Some(EloEstimate {
            elo: elo_from_score(p),
            lower: elo_from_score(p - margin),
            upper: elo_from_score(p + margin),
            games: wdl.games(),
            score: p,
            draw_ratio: d / n,
        })
    }

    /// Half-width of the interval, when finite.
    pub fn error_margin(&self) -> f64 {
        (self.upper - self.lower) / 2.0
    }
}

impl Display for EloEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Elo {:.1} [{:.1}, {:.1}] ({:.1}%, draws {:.1}%, {} games)",
            self.elo,
            self.lower,
            self.upper,
            self.score * 100.0,
            self.draw_ratio * 100.0,
            self.games
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wdl(wins: u64, draws: u64, losses: u64) -> Wdl {
        Wdl {
            wins,
            draws,
            losses,
        }
    }

    #[test]
    fn even_score_is_zero_elo() {
        assert_eq!(elo_from_score(0.5), 0.0);
        let e = EloEstimate::from_wdl(&wdl(3, 4, 3)).unwrap();
        assert_eq!(e.elo, 0.0);
        assert!(e.lower < 0.0 && e.upper > 0.0);
        assert!((e.lower + e.upper).abs() < 1e-9);
    }

    #[test]
    fn logit_boundaries_diverge() {
        assert_eq!(elo_from_score(1.0), f64::INFINITY);
        assert_eq!(elo_from_score(0.0), f64::NEG_INFINITY);
        assert!(elo_from_score(0.999_999) > 2000.0);
        assert!(elo_from_score(0.000_001) < -2000.0);
        assert_eq!(EloEstimate::from_wdl(&wdl(5, 0, 0)).unwrap().elo, f64::INFINITY);
    }

    #[test]
    fn known_values() {
        // 75% is about +191 Elo
        assert!((elo_from_score(0.75) - 190.848).abs() < 1e-3);
        assert!((score_from_elo(elo_from_score(0.3)) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn all_draws_have_no_spread() {
        let e = EloEstimate::from_wdl(&wdl(0, 10, 0)).unwrap();
        assert_eq!(e.elo, 0.0);
        assert_eq!(e.lower, 0.0);
        assert_eq!(e.upper, 0.0);
        assert_eq!(e.draw_ratio, 1.0);
    }

    #[test]
    fn interval_shrinks_with_games() {
        let small = EloEstimate::from_wdl(&wdl(6, 2, 2)).unwrap();
        let large = EloEstimate::from_wdl(&wdl(600, 200, 200)).unwrap();
        assert!((small.elo - large.elo).abs() < 1e-9);
        assert!(large.error_margin() < small.error_margin());
    }

    #[test]
    fn no_games_no_estimate() {
        assert!(EloEstimate::from_wdl(&Wdl::default()).is_none());
        assert_eq!(wdl(1, 2, 3).flipped(), wdl(3, 2, 1));
    }
}
