//! # enginetest
//!
//! Runs matches between chess engines speaking UCI and tells which one is stronger.
//!
//! It provides:
//! - Concurrent game execution, one OS process per engine and game (`Tournament`)
//! - Adjudication of games: time forfeits, move limit, draw and resign rules
//! - Elo estimation with 95% confidence intervals
//! - Sequential probability ratio testing (SPRT) with early stopping
//! - An append-only game log that interrupted runs can resume from
//!
//! Engines are untrusted external programs. A crash, a hang or garbage output only forfeits the
//! game it happened in; memory can be capped per engine through Linux cgroups v2.
//!
//! # Documentation Overview
//!
//! - For the tournament loop and its failure modes, see the [`tournament`] module.
//! - For runner behavior (output, logging, containment), see
//!   [`Configuration`](crate::configuration::Configuration); for time control and per-engine
//!   limits, see [`constraints`].
//! - For the statistics, see [`elo`], [`sprt`] and [`evaluator`].
//! - To plug in something other than a UCI process, implement the [`Engine`](engine::Engine)
//!   and [`EngineFactory`](engine::EngineFactory) traits.
//!
//! # Usage Example
//!
//! An SPRT between a new build and the previous one:
//!
//! ```no_run
//! use enginetest::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_time_control("10+0.1".parse()?)
//!         .with_ram_per_engine(256) // in MB
//!         .build()?;
//!
//!     // Run engines without a cgroup if cgroup v2 is not available
//!     let configuration = Configuration::new().with_allow_uncontained(true);
//!
//!     let engines = EngineConfig::from_paths(&["./build/engine".into(), "./base/engine".into()]);
//!     let mode = EvaluationMode::Sprt(SprtParameters::new(0.0, 5.0));
//!     let config = TournamentConfig::new(mode, engines)
//!         .with_opening_book("openings.epd")
//!         .with_concurrency(8);
//!
//!     let report = Tournament::new(config, configuration, constraints).run()?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
//!
//! ## Engine Requirements
//!
//! - Speak UCI on stdin/stdout: `uci`, `isready`, `ucinewgame`, `position`, `go`, `stop`, `quit`
//! - Answer `go` with `bestmove` before its clock runs out (a small grace period is allowed)
//! - Report `bestmove (none)` or `bestmove 0000` when it has no legal move, with a mate score
//!   for checkmate and `cp 0` for stalemate
//! - Moves are never checked for legality: the engines are trusted to play chess

mod cgroup_manager;
pub use anyhow;
pub mod adjudication;
pub mod configuration;
pub mod constraints;
pub mod elo;
pub mod engine;
pub mod evaluator;
pub mod game_runner;
mod logger;
pub mod opening_book;
pub mod pairing;
pub mod recorder;
pub mod sprt;
#[cfg(test)]
mod test_support;
pub mod tournament;
mod tournament_scheduler;
pub mod uci_engine;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use enginetest::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - [`Tournament`](crate::tournament::Tournament) and its config
/// - the evaluation modes
pub mod prelude {
    pub use crate::adjudication::AdjudicationRules;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::{ConstraintsBuilder, TimeControl};
    pub use crate::engine::{Engine, EngineConfig, EngineFactory};
    pub use crate::evaluator::EvaluationMode;
    pub use crate::opening_book::OpeningOrder;
    pub use crate::sprt::SprtParameters;
    pub use crate::tournament::{Tournament, TournamentConfig, TournamentError, TournamentReport};
}
