//! Engine capability interface.
//!
//! An engine is anything that can be started, told a position, asked to think under a time
//! budget and terminated. The tournament only talks to engines through [`Engine`], and obtains
//! fresh instances through an [`EngineFactory`], so the process-backed
//! [`UciEngine`](crate::uci_engine::UciEngine) and in-memory test doubles are interchangeable.

use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::opening_book::OpeningPosition;

/// Static description of an engine taking part in a tournament.
///
/// Immutable once the tournament starts. Two configs are the same engine when their ids match.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique name of the engine in this tournament.
    pub id: String,
    /// Executable to launch.
    pub path: PathBuf,
    /// Extra command-line arguments given to the executable.
    pub args: Vec<String>,
    /// Fixed `setoption` name/value pairs sent after the handshake.
    pub options: Vec<(String, String)>,
}

impl PartialEq for EngineConfig {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EngineConfig {}

impl Hash for EngineConfig {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl EngineConfig {
    /// Engine with no arguments and no options.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> EngineConfig {
        EngineConfig {
            id: id.into(),
            path: path.into(),
            args: vec![],
            options: vec![],
        }
    }

    /// Append command-line arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a fixed UCI option.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// Build configs from executable paths, naming each engine after its file stem.
    ///
    /// Stems that appear more than once are suffixed with `_1`, `_2`, ... in order of appearance.
    pub fn from_paths(paths: &[PathBuf]) -> Vec<EngineConfig> {
        let stems: Vec<String> = paths.iter().map(|p| file_stem(p)).collect();
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for stem in &stems {
            *occurrences.entry(stem.as_str()).or_default() += 1;
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        stems
            .iter()
            .zip(paths)
            .map(|(stem, path)| {
                let id = if occurrences[stem.as_str()] > 1 {
                    let n = seen.entry(stem.as_str()).or_default();
                    *n += 1;
                    format!("{stem}_{n}")
                } else {
                    stem.clone()
                };
                EngineConfig::new(id, path.clone())
            })
            .collect()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Side of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Moves first from the standard start position.
    White,
    /// The other one.
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// Evaluation reported by an engine, from the point of view of the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Score {
    /// Centipawns.
    Cp(i32),
    /// Mate in N moves; negative when the side to move is getting mated.
    Mate(i32),
}

impl Score {
    const MATE_CP: i32 = 100_000;

    /// Centipawn value, with mate scores mapped beyond any material score.
    pub fn centipawns(self) -> i32 {
        match self {
            Score::Cp(cp) => cp,
            Score::Mate(n) if n > 0 => Self::MATE_CP - n,
            Score::Mate(n) => -Self::MATE_CP - n,
        }
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Score::Cp(cp) => write!(f, "{:+.2}", *cp as f64 / 100.0),
            Score::Mate(n) => write!(f, "#{n}"),
        }
    }
}

/// Clock situation handed to the engine that has to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    /// Side to move.
    pub side: Color,
    /// Time left on white's clock.
    pub white_time: Duration,
    /// Time left on black's clock.
    pub black_time: Duration,
    /// Increment added after each white move.
    pub white_increment: Duration,
    /// Increment added after each black move.
    pub black_increment: Duration,
}

impl SearchLimits {
    /// Time left for the side to move.
    pub fn time_left(&self) -> Duration {
        match self.side {
            Color::White => self.white_time,
            Color::Black => self.black_time,
        }
    }

    /// Increment of the side to move.
    pub fn increment(&self) -> Duration {
        match self.side {
            Color::White => self.white_increment,
            Color::Black => self.black_increment,
        }
    }
}

/// What an engine answers to a search: an opaque move token and the last score it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReply {
    /// Move token, never checked for legality.
    pub best_move: String,
    /// Last `info ... score` seen before the move, if any.
    pub score: Option<Score>,
}

impl SearchReply {
    /// The engine has no move to play (mated or stalemated).
    pub fn is_null_move(&self) -> bool {
        matches!(self.best_move.as_str(), "(none)" | "0000")
    }
}

/// Lifecycle of an engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started yet.
    Uninitialized,
    /// Waiting for a command.
    Ready,
    /// Searching.
    Thinking,
    /// Process gone. Final state.
    Terminated,
}

/// Failures of a single engine. They are local to one game and never abort a tournament on
/// their own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The process could not be launched or did not complete the handshake in time.
    #[error("engine '{engine}' failed to start: {reason}")]
    StartupFailure {
        /// Engine id.
        engine: String,
        /// What went wrong.
        reason: String,
    },
    /// No move within the time budget plus the grace period.
    #[error("engine '{engine}' did not move within {budget_ms} ms (+ grace)")]
    TimeForfeit {
        /// Engine id.
        engine: String,
        /// Budget that was exceeded.
        budget_ms: u64,
    },
    /// Output that cannot be understood.
    #[error("engine '{engine}' protocol error: {reason}")]
    ProtocolError {
        /// Engine id.
        engine: String,
        /// What went wrong.
        reason: String,
    },
    /// The process closed its output or stopped accepting input mid-game.
    #[error("engine '{engine}' exited unexpectedly")]
    Disconnected {
        /// Engine id.
        engine: String,
    },
    /// A command was issued in a state that does not accept it.
    #[error("engine '{engine}' is {state:?}, expected {expected:?}")]
    InvalidState {
        /// Engine id.
        engine: String,
        /// Current state.
        state: EngineState,
        /// State the command requires.
        expected: EngineState,
    },
}

/// The four operations the match runner needs from an engine.
pub trait Engine: Send {
    /// Engine id, as in [`EngineConfig::id`].
    fn id(&self) -> &str;

    /// Current session state.
    fn state(&self) -> EngineState;

    /// Launch and complete the handshake. `Uninitialized -> Ready`.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Tell the engine the opening and the moves played since. Only valid when `Ready`.
    fn set_position(
        &mut self,
        opening: &OpeningPosition,
        moves: &[String],
    ) -> Result<(), EngineError>;

    /// Search under `limits` until a move arrives or the budget plus grace elapses.
    /// `Ready -> Thinking -> Ready`.
    fn think(&mut self, limits: &SearchLimits) -> Result<SearchReply, EngineError>;

    /// Stop the engine for good. Idempotent and bounded in time.
    fn terminate(&mut self);
}

/// Creates one fresh engine session per game and side.
pub trait EngineFactory: Send + Sync + 'static {
    /// Engine type produced.
    type Engine: Engine + 'static;

    /// Returns an engine in the `Uninitialized` state.
    fn create(&self, config: &EngineConfig) -> Self::Engine;
}
