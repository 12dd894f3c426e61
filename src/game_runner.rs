//! Plays one game between two engines.
//!
//! [`play_game`] alternates `think` calls, charges each side's clock with the time actually
//! spent, asks the [`AdjudicationRules`] after every half-move and turns every engine failure
//! into a forfeit. Both engines are terminated before the result is returned, on every path.

use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::{
    adjudication::{AdjudicationRules, Clock, GameState, Verdict},
    constraints::TimeControl,
    elo::PlayerResult,
    engine::{Color, Engine, EngineError, Score, SearchLimits},
    pairing::Pairing,
};

/// Final result of a game, from white's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameOutcome {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameOutcome {
    fn win_for(color: Color) -> GameOutcome {
        match color {
            Color::White => GameOutcome::WhiteWin,
            Color::Black => GameOutcome::BlackWin,
        }
    }
}

impl Display for GameOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameOutcome::WhiteWin => write!(f, "1-0"),
            GameOutcome::BlackWin => write!(f, "0-1"),
            GameOutcome::Draw => write!(f, "1/2-1/2"),
        }
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// The side to move had no move and was not stalemated.
    Checkmate,
    /// The side to move had no move and reported a dead even score.
    Stalemate,
    /// Resign adjudication.
    ScoreReport,
    /// Move cap reached.
    MoveLimit,
    /// Draw adjudication.
    DrawRule,
    /// A side ran out of time.
    Timeout,
    /// An engine did not start or died mid-game.
    Crash,
    /// An engine said something that is not a valid reply.
    ProtocolError,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::Checkmate => "checkmate",
            TerminationReason::Stalemate => "stalemate",
            TerminationReason::ScoreReport => "score-report",
            TerminationReason::MoveLimit => "move-limit",
            TerminationReason::DrawRule => "draw-rule",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Crash => "crash",
            TerminationReason::ProtocolError => "protocol-error",
        };
        f.write_str(s)
    }
}

/// Category of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Startup,
    Timeout,
    Protocol,
    Disconnected,
}

/// An engine failure that decided (part of) a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFailure {
    /// Engine id.
    pub engine: String,
    pub kind: FailureKind,
    /// Human readable detail.
    pub message: String,
}

impl EngineFailure {
    fn from_error(engine: &str, error: &EngineError) -> EngineFailure {
        let kind = match error {
            EngineError::StartupFailure { .. } => FailureKind::Startup,
            EngineError::TimeForfeit { .. } => FailureKind::Timeout,
            EngineError::ProtocolError { .. } | EngineError::InvalidState { .. } => {
                FailureKind::Protocol
            }
            EngineError::Disconnected { .. } => FailureKind::Disconnected,
        };
        EngineFailure {
            engine: engine.to_string(),
            kind,
            message: error.to_string(),
        }
    }

    fn reason(&self) -> TerminationReason {
        match self.kind {
            FailureKind::Startup | FailureKind::Disconnected => TerminationReason::Crash,
            FailureKind::Timeout => TerminationReason::Timeout,
            FailureKind::Protocol => TerminationReason::ProtocolError,
        }
    }
}

/// Everything known about a finished game. Produced exactly once per pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameResult {
    /// Round index of the pairing.
    pub round: u64,
    /// White engine id.
    pub white: String,
    /// Black engine id.
    pub black: String,
    /// Opening book index.
    pub opening_id: usize,
    pub outcome: GameOutcome,
    pub reason: TerminationReason,
    /// Half-moves played after the opening.
    pub plies: u32,
    /// Wall-clock duration, engine startup included.
    pub duration_ms: u64,
    /// Move tokens played after the opening, in order.
    pub moves: Vec<String>,
    /// Engine failures that ended the game, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<EngineFailure>,
}

impl GameResult {
    /// Result for engine `id`, `None` if it did not play this game.
    pub fn result_for(&self, id: &str) -> Option<PlayerResult> {
        let color = if self.white == id {
            Color::White
        } else if self.black == id {
            Color::Black
        } else {
            return None;
        };
        Some(match (self.outcome, color) {
            (GameOutcome::Draw, _) => PlayerResult::Draw,
            (GameOutcome::WhiteWin, Color::White) | (GameOutcome::BlackWin, Color::Black) => {
                PlayerResult::Win
            }
            _ => PlayerResult::Loss,
        })
    }

    /// Drawn game without moves, for a pairing whose game could not be played to the end
    /// through no fault of either engine.
    pub(crate) fn aborted(pairing: &Pairing, duration: Duration) -> GameResult {
        GameResult {
            round: pairing.round,
            white: pairing.white.id.clone(),
            black: pairing.black.id.clone(),
            opening_id: pairing.opening.id,
            outcome: GameOutcome::Draw,
            reason: TerminationReason::Crash,
            plies: 0,
            duration_ms: duration.as_millis() as u64,
            moves: vec![],
            failures: vec![],
        }
    }

    /// Startup failure recorded against engine `id` in this game.
    pub fn failed_startup(&self, id: &str) -> bool {
        self.failures
            .iter()
            .any(|f| f.engine == id && f.kind == FailureKind::Startup)
    }
}

impl Display for GameResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} VS {}: {} ({}, {} plies)",
            self.round, self.white, self.black, self.outcome, self.reason, self.plies
        )
    }
}

/// Per-game settings shared by every game of a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSettings {
    pub time_control: TimeControl,
    pub rules: AdjudicationRules,
}

/// Play `pairing` to completion between `white` and `black`.
///
/// Never fails: engine failures become forfeits. Both engines are terminated on return.
#[instrument(skip_all, fields(round = pairing.round, white = %pairing.white.id, black = %pairing.black.id))]
pub fn play_game<E: Engine>(
    pairing: &Pairing,
    white: &mut E,
    black: &mut E,
    settings: &GameSettings,
) -> GameResult {
    let start = Instant::now();
    let mut game = Game::new(pairing, settings);

    let (outcome, reason) = game.play(white, black);

    white.terminate();
    black.terminate();

    for failure in &game.failures {
        warn!(
            "round {}: {} forfeits ({:?}): {}",
            pairing.round, failure.engine, failure.kind, failure.message
        );
    }
    debug!(?outcome, %reason, plies = game.moves.len(), "game over");

    GameResult {
        round: pairing.round,
        white: pairing.white.id.clone(),
        black: pairing.black.id.clone(),
        opening_id: pairing.opening.id,
        outcome,
        reason,
        plies: game.moves.len() as u32,
        duration_ms: start.elapsed().as_millis() as u64,
        moves: game.moves,
        failures: game.failures,
    }
}

struct Game<'a> {
    pairing: &'a Pairing,
    rules: AdjudicationRules,
    white_clock: Clock,
    black_clock: Clock,
    white_scores: Vec<Option<Score>>,
    black_scores: Vec<Option<Score>>,
    moves: Vec<String>,
    failures: Vec<EngineFailure>,
}

impl<'a> Game<'a> {
    fn new(pairing: &'a Pairing, settings: &GameSettings) -> Game<'a> {
        Game {
            pairing,
            rules: settings.rules,
            white_clock: Clock::new(&settings.time_control),
            black_clock: Clock::new(&settings.time_control),
            white_scores: vec![],
            black_scores: vec![],
            moves: vec![],
            failures: vec![],
        }
    }

    fn play<E: Engine>(&mut self, white: &mut E, black: &mut E) -> (GameOutcome, TerminationReason) {
        let white_start = white.start();
        let black_start = black.start();
        match (white_start, black_start) {
            (Ok(()), Ok(())) => {}
            (Err(w), Err(b)) => {
                self.failures.push(EngineFailure::from_error(white.id(), &w));
                self.failures.push(EngineFailure::from_error(black.id(), &b));
                return (GameOutcome::Draw, TerminationReason::Crash);
            }
            (Err(e), Ok(())) => return self.forfeit(Color::White, white.id(), &e),
            (Ok(()), Err(e)) => return self.forfeit(Color::Black, black.id(), &e),
        }

        let mut side = self.pairing.opening.side_to_move();
        loop {
            let engine: &mut E = match side {
                Color::White => &mut *white,
                Color::Black => &mut *black,
            };
            let limits = self.limits(side);
            trace!(ply = self.moves.len(), %side, "thinking");

            let reply = engine
                .set_position(&self.pairing.opening, &self.moves)
                .and_then(|()| {
                    let thinking = Instant::now();
                    engine.think(&limits).map(|r| (r, thinking.elapsed()))
                });
            let (reply, spent) = match reply {
                Ok(reply) => reply,
                Err(e) => return self.forfeit(side, engine.id(), &e),
            };
            self.clock_mut(side).punch(spent);

            if reply.is_null_move() {
                return match reply.score {
                    Some(Score::Cp(0)) => (GameOutcome::Draw, TerminationReason::Stalemate),
                    _ => (
                        GameOutcome::win_for(side.opposite()),
                        TerminationReason::Checkmate,
                    ),
                };
            }

            self.moves.push(reply.best_move);
            match side {
                Color::White => self.white_scores.push(reply.score),
                Color::Black => self.black_scores.push(reply.score),
            }

            let state = GameState {
                book_plies: self.pairing.opening.moves.len() as u32,
                ply: self.moves.len() as u32,
                white_clock: &self.white_clock,
                black_clock: &self.black_clock,
                white_scores: &self.white_scores,
                black_scores: &self.black_scores,
            };
            match self.rules.adjudicate(&state) {
                Verdict::Continue => side = side.opposite(),
                Verdict::Draw(reason) => return (GameOutcome::Draw, reason),
                Verdict::Decisive { winner, reason } => {
                    return (GameOutcome::win_for(winner), reason)
                }
            }
        }
    }

    fn limits(&self, side: Color) -> SearchLimits {
        SearchLimits {
            side,
            white_time: self.white_clock.remaining(),
            black_time: self.black_clock.remaining(),
            white_increment: self.white_clock.increment(),
            black_increment: self.black_clock.increment(),
        }
    }

    fn clock_mut(&mut self, side: Color) -> &mut Clock {
        match side {
            Color::White => &mut self.white_clock,
            Color::Black => &mut self.black_clock,
        }
    }

    fn forfeit(
        &mut self,
        loser: Color,
        engine: &str,
        error: &EngineError,
    ) -> (GameOutcome, TerminationReason) {
        let failure = EngineFailure::from_error(engine, error);
        let reason = failure.reason();
        self.failures.push(failure);
        (GameOutcome::win_for(loser.opposite()), reason)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        engine::EngineConfig,
        opening_book::OpeningPosition,
        test_support::{Behavior, ScriptedEngine},
    };

    fn pairing() -> Pairing {
        Pairing {
            round: 7,
            white: Arc::new(EngineConfig::new("alpha", "/bin/alpha")),
            black: Arc::new(EngineConfig::new("beta", "/bin/beta")),
            opening: OpeningPosition::startpos(),
        }
    }

    fn settings(max_moves: u32) -> GameSettings {
        GameSettings {
            time_control: TimeControl::from_millis(10_000, 100),
            rules: AdjudicationRules {
                max_moves,
                draw: None,
                resign: None,
            },
        }
    }

    #[test]
    fn move_cap_ends_a_quiet_game_in_a_draw() {
        let mut white = ScriptedEngine::new("alpha", Behavior::Normal);
        let mut black = ScriptedEngine::new("beta", Behavior::Normal);
        let result = play_game(&pairing(), &mut white, &mut black, &settings(5));

        assert_eq!(result.outcome, GameOutcome::Draw);
        assert_eq!(result.reason, TerminationReason::MoveLimit);
        assert_eq!(result.plies, 10);
        assert_eq!(result.moves.len(), 10);
        assert_eq!(result.round, 7);
        assert!(result.failures.is_empty());
        assert!(white.terminated() && black.terminated());
    }

    #[test]
    fn book_moves_count_toward_the_move_cap() {
        let mut pairing = pairing();
        pairing.opening.moves = ["e2e4", "e7e5", "g1f3", "b8c6"].map(String::from).to_vec();
        let mut white = ScriptedEngine::new("alpha", Behavior::Normal);
        let mut black = ScriptedEngine::new("beta", Behavior::Normal);
        let result = play_game(&pairing, &mut white, &mut black, &settings(5));

        assert_eq!(result.reason, TerminationReason::MoveLimit);
        assert_eq!(result.plies, 6);
    }

    #[test]
    fn startup_failure_forfeits_to_the_opponent() {
        let mut white = ScriptedEngine::new("alpha", Behavior::Normal);
        let mut black = ScriptedEngine::new("beta", Behavior::FailStartup);
        let result = play_game(&pairing(), &mut white, &mut black, &settings(5));

        assert_eq!(result.outcome, GameOutcome::WhiteWin);
        assert_eq!(result.reason, TerminationReason::Crash);
        assert_eq!(result.plies, 0);
        assert!(result.failed_startup("beta"));
        assert!(!result.failed_startup("alpha"));
        assert!(white.terminated() && black.terminated());
    }

    #[test]
    fn both_failing_to_start_is_a_draw() {
        let mut white = ScriptedEngine::new("alpha", Behavior::FailStartup);
        let mut black = ScriptedEngine::new("beta", Behavior::FailStartup);
        let result = play_game(&pairing(), &mut white, &mut black, &settings(5));

        assert_eq!(result.outcome, GameOutcome::Draw);
        assert_eq!(result.reason, TerminationReason::Crash);
        assert_eq!(result.failures.len(), 2);
    }

    #[test]
    fn mid_game_failures_map_to_reasons() {
        let cases = [
            (Behavior::CrashAfter(2), TerminationReason::Crash),
            (Behavior::TimeoutAfter(1), TerminationReason::Timeout),
            (Behavior::Garbage, TerminationReason::ProtocolError),
        ];
        for (behavior, reason) in cases {
            let mut white = ScriptedEngine::new("alpha", behavior);
            let mut black = ScriptedEngine::new("beta", Behavior::Normal);
            let result = play_game(&pairing(), &mut white, &mut black, &settings(50));

            assert_eq!(result.outcome, GameOutcome::BlackWin, "{behavior:?}");
            assert_eq!(result.reason, reason, "{behavior:?}");
            assert_eq!(result.failures[0].engine, "alpha");
            assert!(white.terminated() && black.terminated());
        }
    }

    #[test]
    fn null_move_is_mate_or_stalemate() {
        let mut white = ScriptedEngine::new("alpha", Behavior::Normal);
        let mut black = ScriptedEngine::new("beta", Behavior::NoMoveAfter(3, Score::Mate(-1)));
        let result = play_game(&pairing(), &mut white, &mut black, &settings(50));
        assert_eq!(result.outcome, GameOutcome::WhiteWin);
        assert_eq!(result.reason, TerminationReason::Checkmate);
        assert_eq!(result.plies, 6);

        let mut white = ScriptedEngine::new("alpha", Behavior::NoMoveAfter(0, Score::Cp(0)));
        let mut black = ScriptedEngine::new("beta", Behavior::Normal);
        let result = play_game(&pairing(), &mut white, &mut black, &settings(50));
        assert_eq!(result.outcome, GameOutcome::Draw);
        assert_eq!(result.reason, TerminationReason::Stalemate);
    }

    #[test]
    fn results_from_each_side() {
        let mut white = ScriptedEngine::new("alpha", Behavior::Normal);
        let mut black = ScriptedEngine::new("beta", Behavior::Garbage);
        let result = play_game(&pairing(), &mut white, &mut black, &settings(50));
        assert_eq!(result.result_for("alpha"), Some(PlayerResult::Win));
        assert_eq!(result.result_for("beta"), Some(PlayerResult::Loss));
        assert_eq!(result.result_for("gamma"), None);
    }
}
