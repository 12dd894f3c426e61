//! Game adjudication: clocks and the rules that end a game early.
//!
//! [`AdjudicationRules::adjudicate`] is a pure function of the running game state, evaluated
//! after every half-move. Rules are checked in a fixed order:
//!
//! 1. a side whose clock is exhausted loses on time,
//! 2. reaching the move cap is a draw,
//! 3. a long run of near-zero evaluations from both sides is a draw,
//! 4. (optional) a long run of lopsided evaluations is a resignation.
//!
//! Terminations reported by the engines themselves (no legal move) are handled by the game
//! runner before the rules are consulted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    constraints::TimeControl,
    engine::{Color, Score},
    game_runner::TerminationReason,
};

/// Remaining time of one side.
///
/// Kept signed so that an overrun is visible (`remaining < 0` means the flag fell).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    remaining_ms: i64,
    increment_ms: i64,
}

impl Clock {
    /// Full clock for a new game.
    pub fn new(time_control: &TimeControl) -> Clock {
        Clock {
            remaining_ms: millis(time_control.base),
            increment_ms: millis(time_control.increment),
        }
    }

    /// Time left, zero once exhausted.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.remaining_ms.max(0) as u64)
    }

    /// Credited after each move made in time.
    pub fn increment(&self) -> Duration {
        Duration::from_millis(self.increment_ms as u64)
    }

    /// Charge a move: `remaining = remaining - spent + increment`.
    ///
    /// The increment is only credited if the move was made in time.
    pub fn punch(&mut self, spent: Duration) {
        self.remaining_ms = self.remaining_ms.saturating_sub(millis(spent));
        if self.remaining_ms >= 0 {
            self.remaining_ms = self.remaining_ms.saturating_add(self.increment_ms);
        }
    }

    /// The flag fell.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_ms < 0
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Draw when both sides report near-zero scores for long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRule {
    /// Full moves that must be played before the rule applies.
    pub min_moves: u32,
    /// Consecutive scores per side that must be within the threshold.
    pub move_count: u32,
    /// Threshold in centipawns (inclusive).
    pub score: i32,
}

impl Default for DrawRule {
    fn default() -> Self {
        DrawRule {
            min_moves: 40,
            move_count: 3,
            score: 20,
        }
    }
}

/// Resign when one side keeps seeing itself lost and the other agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResignRule {
    /// Consecutive scores per side.
    pub move_count: u32,
    /// Threshold in centipawns (inclusive).
    pub score: i32,
}

impl Default for ResignRule {
    fn default() -> Self {
        ResignRule {
            move_count: 3,
            score: 600,
        }
    }
}

/// All adjudication settings of a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjudicationRules {
    /// Move cap in full moves; `0` disables it.
    pub max_moves: u32,
    /// Score based draw, `None` to disable.
    pub draw: Option<DrawRule>,
    /// Score based resignation, `None` to disable.
    pub resign: Option<ResignRule>,
}

impl Default for AdjudicationRules {
    fn default() -> Self {
        AdjudicationRules {
            max_moves: 150,
            draw: Some(DrawRule::default()),
            resign: None,
        }
    }
}

/// Snapshot of a running game, as seen by the adjudicator.
#[derive(Debug, Clone, Copy)]
pub struct GameState<'a> {
    /// Half-moves of the opening line played before the engines took over.
    pub book_plies: u32,
    /// Half-moves played by the engines.
    pub ply: u32,
    /// White's clock.
    pub white_clock: &'a Clock,
    /// Black's clock.
    pub black_clock: &'a Clock,
    /// Scores reported by white, one per white move, oldest first.
    pub white_scores: &'a [Option<Score>],
    /// Scores reported by black, one per black move, oldest first.
    pub black_scores: &'a [Option<Score>],
}

/// Decision of the adjudicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep playing.
    Continue,
    /// Game drawn.
    Draw(TerminationReason),
    /// Game won by `winner`.
    Decisive {
        /// Side that won.
        winner: Color,
        /// Why.
        reason: TerminationReason,
    },
}

impl AdjudicationRules {
    /// Apply the rules in order to `state`.
    pub fn adjudicate(&self, state: &GameState<'_>) -> Verdict {
        if state.white_clock.is_exhausted() {
            return Verdict::Decisive {
                winner: Color::Black,
                reason: TerminationReason::Timeout,
            };
        }
        if state.black_clock.is_exhausted() {
            return Verdict::Decisive {
                winner: Color::White,
                reason: TerminationReason::Timeout,
            };
        }

        // move numbers count the book line too
        let ply = u64::from(state.book_plies) + u64::from(state.ply);
        if self.max_moves > 0 && ply >= 2 * u64::from(self.max_moves) {
            return Verdict::Draw(TerminationReason::MoveLimit);
        }

        if let Some(draw) = &self.draw {
            let within = |s: Score| s.centipawns().abs() <= draw.score;
            if ply >= 2 * u64::from(draw.min_moves)
                && last_all(state.white_scores, draw.move_count, within)
                && last_all(state.black_scores, draw.move_count, within)
            {
                return Verdict::Draw(TerminationReason::DrawRule);
            }
        }

        if let Some(resign) = &self.resign {
            let losing = |s: Score| s.centipawns() <= -resign.score;
            let winning = |s: Score| s.centipawns() >= resign.score;
            let n = resign.move_count;
            if last_all(state.white_scores, n, losing) && last_all(state.black_scores, n, winning) {
                return Verdict::Decisive {
                    winner: Color::Black,
                    reason: TerminationReason::ScoreReport,
                };
            }
            if last_all(state.black_scores, n, losing) && last_all(state.white_scores, n, winning) {
                return Verdict::Decisive {
                    winner: Color::White,
                    reason: TerminationReason::ScoreReport,
                };
            }
        }

        Verdict::Continue
    }
}

/// The last `n` scores exist and all satisfy `pred`. A side with no score in the window fails.
fn last_all(scores: &[Option<Score>], n: u32, pred: impl Fn(Score) -> bool) -> bool {
    let n = n as usize;
    n > 0
        && scores.len() >= n
        && scores[scores.len() - n..]
            .iter()
            .all(|s| s.is_some_and(|s| pred(s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(ms: u64) -> Clock {
        Clock::new(&TimeControl::from_millis(ms, 0))
    }

    fn state<'a>(
        ply: u32,
        white_clock: &'a Clock,
        black_clock: &'a Clock,
        white_scores: &'a [Option<Score>],
        black_scores: &'a [Option<Score>],
    ) -> GameState<'a> {
        GameState {
            book_plies: 0,
            ply,
            white_clock,
            black_clock,
            white_scores,
            black_scores,
        }
    }

    #[test]
    fn clock_credits_increment_only_in_time() {
        let mut c = Clock::new(&TimeControl::from_millis(1000, 100));
        c.punch(Duration::from_millis(300));
        assert_eq!(c.remaining(), Duration::from_millis(800));
        assert!(!c.is_exhausted());

        c.punch(Duration::from_millis(900));
        assert!(c.is_exhausted());
        assert_eq!(c.remaining(), Duration::ZERO);
    }

    #[test]
    fn move_limit_is_a_draw() {
        let rules = AdjudicationRules {
            max_moves: 10,
            draw: None,
            resign: None,
        };
        let (w, b) = (clock(1000), clock(1000));
        assert_eq!(
            rules.adjudicate(&state(19, &w, &b, &[], &[])),
            Verdict::Continue
        );
        for ply in [20, 21, 500] {
            assert_eq!(
                rules.adjudicate(&state(ply, &w, &b, &[], &[])),
                Verdict::Draw(TerminationReason::MoveLimit)
            );
        }
    }

    #[test]
    fn book_moves_count_toward_move_numbers() {
        let rules = AdjudicationRules {
            max_moves: 10,
            ..Default::default()
        };
        let (w, b) = (clock(1000), clock(1000));
        let after_book = |ply| GameState {
            book_plies: 8,
            ..state(ply, &w, &b, &[], &[])
        };
        assert_eq!(rules.adjudicate(&after_book(11)), Verdict::Continue);
        assert_eq!(
            rules.adjudicate(&after_book(12)),
            Verdict::Draw(TerminationReason::MoveLimit)
        );

        let quiet = [Some(Score::Cp(0)); 3];
        let draw_rule = AdjudicationRules::default();
        let from_book = |book_plies, ply| GameState {
            book_plies,
            ..state(ply, &w, &b, &quiet, &quiet)
        };
        assert_eq!(draw_rule.adjudicate(&from_book(0, 70)), Verdict::Continue);
        assert_eq!(
            draw_rule.adjudicate(&from_book(10, 70)),
            Verdict::Draw(TerminationReason::DrawRule)
        );
    }

    #[test]
    fn huge_clocks_do_not_wrap() {
        let mut c = Clock::new(&TimeControl {
            base: Duration::from_secs(u64::MAX),
            increment: Duration::from_secs(u64::MAX),
        });
        assert!(!c.is_exhausted());
        c.punch(Duration::from_millis(5));
        assert!(!c.is_exhausted());
        assert_eq!(c.remaining(), Duration::from_millis(i64::MAX as u64));
    }

    #[test]
    fn zero_move_cap_disables_the_limit() {
        let rules = AdjudicationRules {
            max_moves: 0,
            draw: None,
            resign: None,
        };
        let (w, b) = (clock(1000), clock(1000));
        assert_eq!(
            rules.adjudicate(&state(10_000, &w, &b, &[], &[])),
            Verdict::Continue
        );
    }

    #[test]
    fn timeout_comes_first() {
        let rules = AdjudicationRules {
            max_moves: 1,
            ..Default::default()
        };
        let w = clock(1000);
        let mut b = clock(10);
        b.punch(Duration::from_millis(20));
        assert_eq!(
            rules.adjudicate(&state(400, &w, &b, &[], &[])),
            Verdict::Decisive {
                winner: Color::White,
                reason: TerminationReason::Timeout
            }
        );
    }

    #[test]
    fn draw_rule_needs_enough_moves_and_quiet_scores() {
        let rules = AdjudicationRules::default();
        let (w, b) = (clock(1000), clock(1000));
        let quiet = [Some(Score::Cp(5)), Some(Score::Cp(-20)), Some(Score::Cp(0))];
        let noisy = [Some(Score::Cp(5)), Some(Score::Cp(21)), Some(Score::Cp(0))];
        let missing = [Some(Score::Cp(5)), None, Some(Score::Cp(0))];

        assert_eq!(
            rules.adjudicate(&state(79, &w, &b, &quiet, &quiet)),
            Verdict::Continue
        );
        assert_eq!(
            rules.adjudicate(&state(80, &w, &b, &quiet, &quiet)),
            Verdict::Draw(TerminationReason::DrawRule)
        );
        assert_eq!(
            rules.adjudicate(&state(80, &w, &b, &quiet, &noisy)),
            Verdict::Continue
        );
        assert_eq!(
            rules.adjudicate(&state(80, &w, &b, &missing, &quiet)),
            Verdict::Continue
        );
        assert_eq!(
            rules.adjudicate(&state(80, &w, &b, &quiet[1..], &quiet)),
            Verdict::Continue
        );
    }

    #[test]
    fn resign_rule_needs_agreement() {
        let rules = AdjudicationRules {
            resign: Some(ResignRule {
                move_count: 2,
                score: 500,
            }),
            ..Default::default()
        };
        let (w, b) = (clock(1000), clock(1000));
        let lost = [Some(Score::Cp(-600)), Some(Score::Mate(-3))];
        let won = [Some(Score::Cp(700)), Some(Score::Cp(550))];
        let unsure = [Some(Score::Cp(700)), Some(Score::Cp(100))];

        assert_eq!(
            rules.adjudicate(&state(10, &w, &b, &lost, &won)),
            Verdict::Decisive {
                winner: Color::Black,
                reason: TerminationReason::ScoreReport
            }
        );
        assert_eq!(
            rules.adjudicate(&state(10, &w, &b, &won, &lost)),
            Verdict::Decisive {
                winner: Color::White,
                reason: TerminationReason::ScoreReport
            }
        );
        assert_eq!(
            rules.adjudicate(&state(10, &w, &b, &lost, &unsure)),
            Verdict::Continue
        );
    }
}
