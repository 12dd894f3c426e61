//! Consumes game results and decides when the tournament may stop.
//!
//! The evaluator is fed by a single consumer, one result at a time, in completion order. Its
//! state is a pure function of the set of results it has seen: results are keyed by round, so
//! replaying a log twice or in another order gives the same statistics.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    elo::{EloEstimate, Wdl},
    game_runner::GameResult,
    sprt::{InvalidSprtParameters, Sprt, SprtDecision, SprtParameters, SprtState},
};

/// How results are turned into a verdict. Fixed for the whole tournament.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Fixed number of games, then an Elo estimate per pair.
    Elo { num_games: u64 },
    /// Sequential test of the first engine against the second.
    Sprt(SprtParameters),
}

impl EvaluationMode {
    /// Most games this mode will ever ask for.
    pub fn max_games(&self) -> Option<u64> {
        match self {
            EvaluationMode::Elo { num_games } => Some(*num_games),
            EvaluationMode::Sprt(params) => params.max_games,
        }
    }
}

/// Whether the scheduler should keep issuing games.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Elo mode played its games.
    GameCount,
    /// SPRT reached a decision.
    Sprt(SprtDecision),
}

/// Results of one engine pair, from the point of view of the engine listed first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStats {
    pub as_white: Wdl,
    pub as_black: Wdl,
}

impl PairStats {
    pub fn total(&self) -> Wdl {
        self.as_white.merged(self.as_black)
    }
}

/// Elo estimate of `first` against `second`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairEstimate {
    pub first: String,
    pub second: String,
    pub stats: PairStats,
    /// `None` before the pair played.
    pub estimate: Option<EloEstimate>,
}

/// Win/draw/loss accumulation, Elo estimation and SPRT.
#[derive(Debug, Clone)]
pub struct SequentialEvaluator {
    mode: EvaluationMode,
    engines: Vec<String>,
    pairs: BTreeMap<(usize, usize), PairStats>,
    sprt: Option<Sprt>,
    rounds: HashSet<u64>,
}

impl SequentialEvaluator {
    /// Evaluator for `engines`, in tournament order. In SPRT mode the first engine is the one
    /// under test and the second the baseline.
    pub fn new(
        mode: EvaluationMode,
        engines: Vec<String>,
    ) -> Result<SequentialEvaluator, InvalidSprtParameters> {
        let sprt = match mode {
            EvaluationMode::Sprt(params) => Some(Sprt::new(params)?),
            EvaluationMode::Elo { .. } => None,
        };
        Ok(SequentialEvaluator {
            mode,
            engines,
            pairs: BTreeMap::new(),
            sprt,
            rounds: HashSet::new(),
        })
    }

    /// Account for one result. A round already seen is ignored.
    pub fn update(&mut self, result: &GameResult) -> Progress {
        if !self.rounds.insert(result.round) {
            return self.progress();
        }
        let (Some(white), Some(black)) = (self.index(&result.white), self.index(&result.black))
        else {
            warn!("ignoring result of unknown engines: {result}");
            self.rounds.remove(&result.round);
            return self.progress();
        };

        let (first, second) = (white.min(black), white.max(black));
        let first_id = &self.engines[first];
        if let Some(outcome) = result.result_for(first_id) {
            let stats = self.pairs.entry((first, second)).or_default();
            if first == white {
                stats.as_white.add(outcome);
            } else {
                stats.as_black.add(outcome);
            }
        }

        if let Some(sprt) = &mut self.sprt {
            if let Some(outcome) = self.engines.first().and_then(|id| result.result_for(id)) {
                sprt.update(outcome);
            }
        }
        self.progress()
    }

    /// Feed many results, e.g. from a log.
    pub fn replay<'a>(&mut self, results: impl IntoIterator<Item = &'a GameResult>) -> Progress {
        for result in results {
            self.update(result);
        }
        self.progress()
    }

    pub fn progress(&self) -> Progress {
        match (&self.mode, &self.sprt) {
            (_, Some(sprt)) => match sprt.decision() {
                Some(decision) => Progress::Stop(StopReason::Sprt(decision)),
                None => Progress::Continue,
            },
            (EvaluationMode::Elo { num_games }, None) if self.games() >= *num_games => {
                Progress::Stop(StopReason::GameCount)
            }
            _ => Progress::Continue,
        }
    }

    /// Results accounted for.
    pub fn games(&self) -> u64 {
        self.rounds.len() as u64
    }

    /// Rounds accounted for.
    pub fn rounds(&self) -> &HashSet<u64> {
        &self.rounds
    }

    pub fn mode(&self) -> &EvaluationMode {
        &self.mode
    }

    pub fn sprt_state(&self) -> Option<SprtState> {
        self.sprt.as_ref().map(Sprt::state)
    }

    /// Estimate for every pair, in engine order.
    pub fn pair_estimates(&self) -> Vec<PairEstimate> {
        let n = self.engines.len();
        let mut estimates = vec![];
        for i in 0..n {
            for j in i + 1..n {
                let stats = self.pairs.get(&(i, j)).copied().unwrap_or_default();
                estimates.push(PairEstimate {
                    first: self.engines[i].clone(),
                    second: self.engines[j].clone(),
                    stats,
                    estimate: EloEstimate::from_wdl(&stats.total()),
                });
            }
        }
        estimates
    }

    /// Everything engine `id` scored against the field.
    pub fn engine_totals(&self, id: &str) -> Wdl {
        let Some(index) = self.index(id) else {
            return Wdl::default();
        };
        self.pairs
            .iter()
            .filter_map(|(&(i, j), stats)| {
                if i == index {
                    Some(stats.total())
                } else if j == index {
                    Some(stats.total().flipped())
                } else {
                    None
                }
            })
            .fold(Wdl::default(), Wdl::merged)
    }

    /// One line summary for progress output.
    pub fn status_line(&self) -> String {
        let mut line = format!("games {}", self.games());
        if let Some(state) = self.sprt_state() {
            line.push_str(&format!(", {state}"));
        }
        if let [estimate] = self.pair_estimates().as_slice() {
            line.push_str(&format!(", {}", estimate.stats.total()));
            if let Some(elo) = &estimate.estimate {
                line.push_str(&format!(", Elo {:.1} +/- {:.1}", elo.elo, elo.error_margin()));
            }
        }
        line
    }

    fn index(&self, id: &str) -> Option<usize> {
        self.engines.iter().position(|e| e == id)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    use super::*;
    use crate::game_runner::{GameOutcome, TerminationReason};

    fn game(round: u64, white: &str, black: &str, outcome: GameOutcome) -> GameResult {
        GameResult {
            round,
            white: white.to_string(),
            black: black.to_string(),
            opening_id: 0,
            outcome,
            reason: TerminationReason::Checkmate,
            plies: 40,
            duration_ms: 10,
            moves: vec![],
            failures: vec![],
        }
    }

    fn engines(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn random_games(seed: u64, n: u64) -> Vec<GameResult> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|round| {
                let (w, b) = if round % 2 == 0 { ("new", "old") } else { ("old", "new") };
                let outcome = match rng.gen_range(0..3) {
                    0 => GameOutcome::WhiteWin,
                    1 => GameOutcome::BlackWin,
                    _ => GameOutcome::Draw,
                };
                game(round, w, b, outcome)
            })
            .collect()
    }

    #[test]
    fn elo_mode_stops_at_game_count() {
        let mut eval =
            SequentialEvaluator::new(EvaluationMode::Elo { num_games: 2 }, engines(&["a", "b"]))
                .unwrap();
        assert_eq!(
            eval.update(&game(0, "a", "b", GameOutcome::WhiteWin)),
            Progress::Continue
        );
        assert_eq!(
            eval.update(&game(1, "b", "a", GameOutcome::WhiteWin)),
            Progress::Stop(StopReason::GameCount)
        );
        let [pair] = eval.pair_estimates().try_into().unwrap();
        assert_eq!(pair.stats.as_white.wins, 1);
        assert_eq!(pair.stats.as_black.losses, 1);
        assert_eq!(pair.estimate.unwrap().elo, 0.0);
    }

    #[test]
    fn order_and_duplicates_do_not_matter() {
        let games = random_games(11, 60);
        let mode = EvaluationMode::Sprt(SprtParameters::new(0.0, 10.0));

        let mut in_order = SequentialEvaluator::new(mode, engines(&["new", "old"])).unwrap();
        in_order.replay(&games);

        let mut shuffled_games = games.clone();
        shuffled_games.shuffle(&mut StdRng::seed_from_u64(5));
        shuffled_games.extend(games.iter().take(10).cloned());
        let mut shuffled = SequentialEvaluator::new(mode, engines(&["new", "old"])).unwrap();
        shuffled.replay(&shuffled_games);

        assert_eq!(in_order.games(), 60);
        assert_eq!(shuffled.games(), 60);
        assert_eq!(in_order.pair_estimates(), shuffled.pair_estimates());
        assert_eq!(in_order.sprt_state(), shuffled.sprt_state());
    }

    #[test]
    fn sprt_counts_from_the_first_engine() {
        let mode = EvaluationMode::Sprt(SprtParameters::new(0.0, 10.0));
        let mut eval = SequentialEvaluator::new(mode, engines(&["new", "old"])).unwrap();
        eval.update(&game(0, "old", "new", GameOutcome::BlackWin));
        eval.update(&game(1, "new", "old", GameOutcome::Draw));
        let state = eval.sprt_state().unwrap();
        assert_eq!(
            state.wdl,
            Wdl {
                wins: 1,
                draws: 1,
                losses: 0
            }
        );
        assert!(state.llr > 0.0);
    }

    #[test]
    fn sprt_stops_on_decision() {
        let mode = EvaluationMode::Sprt(SprtParameters::new(0.0, 10.0));
        let mut eval = SequentialEvaluator::new(mode, engines(&["new", "old"])).unwrap();
        let mut round = 0;
        let progress = loop {
            let progress = eval.update(&game(round, "new", "old", GameOutcome::WhiteWin));
            if progress != Progress::Continue {
                break progress;
            }
            round += 1;
            assert!(round < 1_000);
        };
        assert_eq!(
            progress,
            Progress::Stop(StopReason::Sprt(SprtDecision::AcceptH1))
        );
    }

    #[test]
    fn multi_engine_totals() {
        let mut eval = SequentialEvaluator::new(
            EvaluationMode::Elo { num_games: 10 },
            engines(&["a", "b", "c"]),
        )
        .unwrap();
        eval.update(&game(0, "a", "b", GameOutcome::WhiteWin));
        eval.update(&game(1, "c", "a", GameOutcome::Draw));
        eval.update(&game(2, "b", "c", GameOutcome::BlackWin));

        assert_eq!(
            eval.engine_totals("a"),
            Wdl {
                wins: 1,
                draws: 1,
                losses: 0
            }
        );
        assert_eq!(
            eval.engine_totals("c"),
            Wdl {
                wins: 1,
                draws: 1,
                losses: 0
            }
        );
        assert_eq!(eval.engine_totals("b").losses, 2);
        assert_eq!(eval.pair_estimates().len(), 3);
    }

    #[test]
    fn unknown_engines_are_ignored() {
        let mut eval =
            SequentialEvaluator::new(EvaluationMode::Elo { num_games: 1 }, engines(&["a", "b"]))
                .unwrap();
        assert_eq!(
            eval.update(&game(0, "a", "zzz", GameOutcome::WhiteWin)),
            Progress::Continue
        );
        assert_eq!(eval.games(), 0);
        assert_eq!(eval.engine_totals("a"), Wdl::default());
    }

    #[test]
    fn invalid_sprt_is_rejected() {
        let mode = EvaluationMode::Sprt(SprtParameters::new(10.0, 0.0));
        assert!(SequentialEvaluator::new(mode, engines(&["a", "b"])).is_err());
    }
}
