//! Sequential probability ratio test between two Elo hypotheses.
//!
//! Game outcomes are modelled as a trinomial {win, draw, loss} with the BayesElo draw model:
//! for a BayesElo difference `e` and draw parameter `d`,
//!
//! ```text
//! P(win)  = 1 / (1 + 10^((d - e) / 400))
//! P(loss) = 1 / (1 + 10^((d + e) / 400))
//! P(draw) = 1 - P(win) - P(loss)
//! ```
//!
//! Each hypothesis is given as a logistic Elo difference, converted to its expected score and
//! then to the BayesElo difference with that expected score.
//!
//! This is not the normalized (GSPRT) model: the error rates hold as long as the draw model
//! fits the games. The draw parameter is therefore estimated from the games themselves once
//! wins, draws and losses have all been seen,
//!
//! ```text
//! d = 200 * log10((1 - l) / l * (1 - w) / w)
//! ```
//!
//! with `w` and `l` the observed win and loss rates. Before that, the configured `draw_elo` is
//! used. The log-likelihood ratio only depends on the win/draw/loss counts, so feeding games
//! one at a time or all at once yields the same value.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::elo::{score_from_elo, PlayerResult, Wdl};

/// Test settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SprtParameters {
    /// Null hypothesis, in Elo.
    pub elo0: f64,
    /// Alternative hypothesis, in Elo.
    pub elo1: f64,
    /// False positive rate.
    pub alpha: f64,
    /// False negative rate.
    pub beta: f64,
    /// BayesElo draw parameter used until every outcome has been seen.
    pub draw_elo: f64,
    /// Give up without a decision after this many games.
    pub max_games: Option<u64>,
}

impl SprtParameters {
    /// `H0: elo0`, `H1: elo1`, 5% error rates, draw Elo 200, no game cap.
    pub fn new(elo0: f64, elo1: f64) -> SprtParameters {
        SprtParameters {
            elo0,
            elo1,
            alpha: 0.05,
            beta: 0.05,
            draw_elo: 200.0,
            max_games: None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidSprtParameters> {
        let err = |reason: &str| Err(InvalidSprtParameters(reason.to_string()));
        if !(self.elo0.is_finite() && self.elo1.is_finite()) {
            return err("Elo hypotheses must be finite");
        }
        if self.elo1 <= self.elo0 {
            return err("elo1 must be greater than elo0");
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0 && self.beta > 0.0 && self.beta < 1.0) {
            return err("alpha and beta must be in (0, 1)");
        }
        if self.alpha + self.beta >= 1.0 {
            return err("alpha + beta must be less than 1");
        }
        if !(self.draw_elo.is_finite() && self.draw_elo > 0.0) {
            return err("draw Elo must be positive");
        }
        Ok(())
    }

    /// Bounds `(ln(beta / (1 - alpha)), ln((1 - beta) / alpha))`.
    pub fn bounds(&self) -> (f64, f64) {
        (
            (self.beta / (1.0 - self.alpha)).ln(),
            ((1.0 - self.beta) / self.alpha).ln(),
        )
    }
}

/// Error returned by [`SprtParameters::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid SPRT parameters: {0}")]
pub struct InvalidSprtParameters(String);

/// Outcome of the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SprtDecision {
    /// LLR reached the lower bound.
    AcceptH0,
    /// LLR reached the upper bound.
    AcceptH1,
    /// Game cap reached first.
    Inconclusive,
}

impl Display for SprtDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SprtDecision::AcceptH0 => write!(f, "H0 accepted"),
            SprtDecision::AcceptH1 => write!(f, "H1 accepted"),
            SprtDecision::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// Snapshot of the test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SprtState {
    /// Counts from the tested engine's point of view.
    pub wdl: Wdl,
    pub llr: f64,
    pub lower: f64,
    pub upper: f64,
    pub decision: Option<SprtDecision>,
}

impl Display for SprtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LLR {:.2} [{:.2}, {:.2}] {}",
            self.llr, self.lower, self.upper, self.wdl
        )?;
        if let Some(decision) = self.decision {
            write!(f, " {decision}")?;
        }
        Ok(())
    }
}

/// Running SPRT. The decision is taken at the first bound crossing and never revised; later
/// games still update the counts.
#[derive(Debug, Clone)]
pub struct Sprt {
    params: SprtParameters,
    lower: f64,
    upper: f64,
    wdl: Wdl,
    decision: Option<SprtDecision>,
}

impl Sprt {
    pub fn new(params: SprtParameters) -> Result<Sprt, InvalidSprtParameters> {
        params.validate()?;
        let (lower, upper) = params.bounds();
        Ok(Sprt {
            params,
            lower,
            upper,
            wdl: Wdl::default(),
            decision: None,
        })
    }

    /// Account for one game. Returns the decision, if any.
    pub fn update(&mut self, result: PlayerResult) -> Option<SprtDecision> {
        self.wdl.add(result);
        if self.decision.is_none() {
            let llr = self.llr();
            if llr >= self.upper {
                self.decision = Some(SprtDecision::AcceptH1);
            } else if llr <= self.lower {
                self.decision = Some(SprtDecision::AcceptH0);
            } else if self
                .params
                .max_games
                .is_some_and(|max| self.wdl.games() >= max)
            {
                self.decision = Some(SprtDecision::Inconclusive);
            }
        }
        self.decision
    }

    /// Log-likelihood ratio of the games seen so far.
    pub fn llr(&self) -> f64 {
        let draw_elo = self.draw_elo();
        let p0 = outcome_probabilities(self.params.elo0, draw_elo);
        let p1 = outcome_probabilities(self.params.elo1, draw_elo);
        llr(&self.wdl, &[0, 1, 2].map(|i| (p1[i] / p0[i]).ln()))
    }

    /// Draw parameter of the model: estimated from the games once each outcome occurred,
    /// the configured one before.
    pub fn draw_elo(&self) -> f64 {
        estimate_draw_elo(&self.wdl).unwrap_or(self.params.draw_elo)
    }

    pub fn decision(&self) -> Option<SprtDecision> {
        self.decision
    }

    pub fn parameters(&self) -> &SprtParameters {
        &self.params
    }

    pub fn state(&self) -> SprtState {
        SprtState {
            wdl: self.wdl,
            llr: self.llr(),
            lower: self.lower,
            upper: self.upper,
            decision: self.decision,
        }
    }
}

fn llr(wdl: &Wdl, log_ratios: &[f64; 3]) -> f64 {
    wdl.wins as f64 * log_ratios[0]
        + wdl.draws as f64 * log_ratios[1]
        + wdl.losses as f64 * log_ratios[2]
}

/// BayesElo draw parameter matching the observed rates. `None` unless every outcome occurred.
fn estimate_draw_elo(wdl: &Wdl) -> Option<f64> {
    if wdl.wins == 0 || wdl.draws == 0 || wdl.losses == 0 {
        return None;
    }
    let games = wdl.games() as f64;
    let (w, l) = (wdl.wins as f64 / games, wdl.losses as f64 / games);
    Some(200.0 * ((1.0 - l) / l * (1.0 - w) / w).log10())
}

/// `[P(win), P(draw), P(loss)]` for a logistic Elo difference.
fn outcome_probabilities(elo: f64, draw_elo: f64) -> [f64; 3] {
    let bayes_elo = bayes_elo_for_score(score_from_elo(elo), draw_elo);
    let win = 1.0 / (1.0 + 10f64.powf((draw_elo - bayes_elo) / 400.0));
    let loss = 1.0 / (1.0 + 10f64.powf((draw_elo + bayes_elo) / 400.0));
    [win, 1.0 - win - loss, loss]
}

/// BayesElo difference whose expected score is `score`, by bisection (the score is increasing
/// in the BayesElo difference).
fn bayes_elo_for_score(score: f64, draw_elo: f64) -> f64 {
    let expected = |e: f64| {
        let win = 1.0 / (1.0 + 10f64.powf((draw_elo - e) / 400.0));
        let loss = 1.0 / (1.0 + 10f64.powf((draw_elo + e) / 400.0));
        0.5 + 0.5 * (win - loss)
    };
    let (mut low, mut high) = (-4000.0, 4000.0);
    for _ in 0..100 {
        let mid = (low + high) / 2.0;
        if expected(mid) < score {
            low = mid;
        } else {
            high = mid;
        }
    }
    (low + high) / 2.0
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn random_results(seed: u64, n: usize) -> Vec<PlayerResult> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| match rng.gen_range(0..3) {
                0 => PlayerResult::Win,
                1 => PlayerResult::Draw,
                _ => PlayerResult::Loss,
            })
            .collect()
    }

    #[test]
    fn default_bounds() {
        let (lower, upper) = SprtParameters::new(0.0, 5.0).bounds();
        assert!((lower - (-2.944_438_979)).abs() < 1e-6);
        assert!((upper - 2.944_438_979).abs() < 1e-6);
    }

    #[test]
    fn probabilities_are_consistent() {
        for elo in [-50.0, 0.0, 10.0, 200.0] {
            let [w, d, l] = outcome_probabilities(elo, 200.0);
            assert!(w > 0.0 && d > 0.0 && l > 0.0);
            assert!((w + d + l - 1.0).abs() < 1e-12);
            assert!((w + 0.5 * d - score_from_elo(elo)).abs() < 1e-9);
        }
        let [w, _, l] = outcome_probabilities(0.0, 200.0);
        assert!((w - l).abs() < 1e-9);
    }

    #[test]
    fn draw_elo_follows_the_games() {
        let mut sprt = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        sprt.update(PlayerResult::Win);
        sprt.update(PlayerResult::Loss);
        assert_eq!(sprt.draw_elo(), 200.0);

        // drawish: 1 win, 8 draws, 1 loss
        for _ in 0..8 {
            sprt.update(PlayerResult::Draw);
        }
        let expected = 200.0 * (9.0f64 * 9.0).log10();
        assert!((sprt.draw_elo() - expected).abs() < 1e-9);
        assert!(sprt.draw_elo() > 200.0);

        // the fitted model reproduces the observed draw rate
        let [w, d, l] = outcome_probabilities(0.0, sprt.draw_elo());
        assert!((w - 0.1).abs() < 1e-6 && (l - 0.1).abs() < 1e-6);
        assert!((d - 0.8).abs() < 1e-6);
    }

    #[test]
    fn incremental_update_is_exact() {
        let results = random_results(7, 200);
        for split in [0, 1, 57, 199] {
            let mut first = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
            for r in &results[..split] {
                first.update(*r);
            }
            first.update(results[split]);

            let mut direct = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
            for r in &results[..=split] {
                direct.update(*r);
            }
            assert_eq!(first.llr(), direct.llr());
        }
    }

    #[test]
    fn order_does_not_matter() {
        let mut results = random_results(3, 100);
        let mut forward = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        results.iter().for_each(|r| {
            forward.update(*r);
        });
        results.reverse();
        let mut backward = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        results.iter().for_each(|r| {
            backward.update(*r);
        });
        assert_eq!(forward.llr(), backward.llr());
    }

    #[test]
    fn all_wins_accept_h1_quickly() {
        let mut sprt = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        let mut previous = sprt.llr();
        let mut games = 0;
        while sprt.decision().is_none() {
            sprt.update(PlayerResult::Win);
            assert!(sprt.llr() > previous);
            previous = sprt.llr();
            games += 1;
            assert!(games < 1_000, "no decision after {games} wins");
        }
        assert_eq!(sprt.decision(), Some(SprtDecision::AcceptH1));
    }

    #[test]
    fn all_losses_accept_h0() {
        let mut sprt = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        let mut games = 0;
        while sprt.update(PlayerResult::Loss).is_none() {
            games += 1;
            assert!(games < 1_000);
        }
        assert_eq!(sprt.decision(), Some(SprtDecision::AcceptH0));
    }

    #[test]
    fn decision_is_sticky() {
        let mut sprt = Sprt::new(SprtParameters::new(0.0, 10.0)).unwrap();
        while sprt.update(PlayerResult::Win).is_none() {}
        for _ in 0..1_000 {
            assert_eq!(
                sprt.update(PlayerResult::Loss),
                Some(SprtDecision::AcceptH1)
            );
        }
        assert!(sprt.llr() < sprt.state().lower);
    }

    #[test]
    fn game_cap_is_inconclusive() {
        let params = SprtParameters {
            max_games: Some(4),
            ..SprtParameters::new(0.0, 10.0)
        };
        let mut sprt = Sprt::new(params).unwrap();
        let decisions: Vec<_> = [
            PlayerResult::Win,
            PlayerResult::Loss,
            PlayerResult::Draw,
            PlayerResult::Draw,
        ]
        .into_iter()
        .map(|r| sprt.update(r))
        .collect();
        assert_eq!(
            decisions,
            vec![None, None, None, Some(SprtDecision::Inconclusive)]
        );
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Sprt::new(SprtParameters::new(5.0, 5.0)).is_err());
        assert!(Sprt::new(SprtParameters::new(0.0, f64::NAN)).is_err());
        for (alpha, beta) in [(0.0, 0.05), (0.05, 1.0), (0.6, 0.5)] {
            let params = SprtParameters {
                alpha,
                beta,
                ..SprtParameters::new(0.0, 5.0)
            };
            assert!(params.validate().is_err(), "{alpha} {beta}");
        }
        let params = SprtParameters {
            draw_elo: 0.0,
            ..SprtParameters::new(0.0, 5.0)
        };
        assert!(params.validate().is_err());
    }
}
