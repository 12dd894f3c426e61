//! Tournament orchestration.
//!
//! This module defines [`Tournament`], which runs a whole test between engines:
//!
//! - validating the [`TournamentConfig`] before anything touches the disk
//! - generating pairings (round robin, colors swapped on repeated openings)
//! - running up to `concurrency` games at once, one thread per game
//! - recording every result durably, then handing it to the [`SequentialEvaluator`]
//! - stopping when the evaluator says so, letting games in flight finish
//!
//! Results flow from the game threads to the orchestrating thread through a single channel;
//! the evaluator and the recorder are only ever touched by that one consumer.
//!
//! # Failures
//!
//! Engine failures stay inside their game and are recorded as forfeits. Only three conditions
//! end a tournament early, all reported as a [`TournamentError`]:
//!
//! - an invalid configuration, detected before any game starts
//! - an engine that failed to start `max_startup_failures` times in a row
//! - a result that could not be written to the log
//!
//! # Example
//!
//! ```no_run
//! use enginetest::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engines = EngineConfig::from_paths(&["./new".into(), "./old".into()]);
//!     let config = TournamentConfig::new(EvaluationMode::Elo { num_games: 100 }, engines)
//!         .with_concurrency(4);
//!     let constraints = ConstraintsBuilder::new()
//!         .with_time_control("10+0.1".parse()?)
//!         .build()?;
//!
//!     let report = Tournament::new(config, Configuration::new(), constraints).run()?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

use std::{
    any::Any,
    collections::HashMap,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use anyhow::Context;
use thiserror::Error;
use tracing::{error, info, instrument, trace, warn};

use crate::{
    adjudication::AdjudicationRules,
    configuration::Configuration,
    constraints::Constraints,
    elo::Wdl,
    engine::{EngineConfig, EngineFactory},
    evaluator::{EvaluationMode, PairEstimate, Progress, SequentialEvaluator, StopReason},
    game_runner::{play_game, GameResult, GameSettings},
    logger::init_logger,
    opening_book::{OpeningBook, OpeningOrder, OpeningSource},
    pairing::{Pairing, RoundRobin},
    recorder::{ResultRecorder, TournamentMeta},
    sprt::SprtState,
    tournament_scheduler::TournamentScheduler,
    uci_engine::UciEngineFactory,
};

/// Errors that end a tournament.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TournamentError {
    /// Invalid settings. Nothing was run.
    #[error("configuration error: {0}")]
    Config(String),
    /// An engine keeps failing to start.
    #[error("engine '{engine}' failed to start {failures} times in a row, aborting")]
    StartupAbort { engine: String, failures: u32 },
    /// A result could not be made durable.
    #[error("could not record result to {}: {reason}", path.display())]
    RecorderWrite { path: PathBuf, reason: String },
}

impl TournamentError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            TournamentError::Config(_) => 2,
            TournamentError::StartupAbort { .. } => 3,
            TournamentError::RecorderWrite { .. } => 4,
        }
    }
}

/// Everything that defines a tournament.
#[derive(Debug, Clone)]
pub struct TournamentConfig {
    pub mode: EvaluationMode,
    /// Participants. In SPRT mode, the engine under test then the baseline.
    pub engines: Vec<EngineConfig>,
    /// `None` plays every game from the standard start position.
    pub opening_book: Option<PathBuf>,
    pub opening_order: OpeningOrder,
    /// Seed of the opening order. `None` picks one (or reuses the resumed log's).
    pub seed: Option<u64>,
    /// Games played at the same time.
    pub concurrency: usize,
    /// Play each opening twice per pair, colors swapped.
    pub repeat: bool,
    pub adjudication: AdjudicationRules,
    /// Consecutive startup failures of one engine that abort the tournament. `0` never aborts.
    pub max_startup_failures: u32,
    /// Where new logs are created.
    pub output_dir: PathBuf,
    /// Log of an interrupted run to continue.
    pub resume: Option<PathBuf>,
}

impl TournamentConfig {
    /// Defaults: standard start position, random order, concurrency 4, repeat on, default
    /// adjudication, abort after 3 consecutive startup failures, logs in the current directory.
    pub fn new(mode: EvaluationMode, engines: Vec<EngineConfig>) -> TournamentConfig {
        TournamentConfig {
            mode,
            engines,
            opening_book: None,
            opening_order: OpeningOrder::default(),
            seed: None,
            concurrency: 4,
            repeat: true,
            adjudication: AdjudicationRules::default(),
            max_startup_failures: 3,
            output_dir: PathBuf::from("."),
            resume: None,
        }
    }

    pub fn with_opening_book(mut self, path: impl Into<PathBuf>) -> Self {
        self.opening_book = Some(path.into());
        self
    }

    pub fn with_opening_order(mut self, order: OpeningOrder) -> Self {
        self.opening_order = order;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_adjudication(mut self, rules: AdjudicationRules) -> Self {
        self.adjudication = rules;
        self
    }

    pub fn with_max_startup_failures(mut self, failures: u32) -> Self {
        self.max_startup_failures = failures;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_resume(mut self, log: impl Into<PathBuf>) -> Self {
        self.resume = Some(log.into());
        self
    }

    /// Check the settings make a runnable tournament.
    pub fn validate(&self) -> Result<(), TournamentError> {
        let err = |msg: String| Err(TournamentError::Config(msg));
        match &self.mode {
            EvaluationMode::Sprt(params) => {
                if self.engines.len() != 2 {
                    return err(format!(
                        "SPRT needs exactly two engines, got {}",
                        self.engines.len()
                    ));
                }
                if let Err(e) = params.validate() {
                    return err(e.to_string());
                }
            }
            EvaluationMode::Elo { num_games } => {
                if self.engines.len() < 2 {
                    return err(format!(
                        "Elo estimation needs at least two engines, got {}",
                        self.engines.len()
                    ));
                }
                if *num_games == 0 {
                    return err("the number of games must be positive".to_string());
                }
            }
        }
        if self.concurrency == 0 {
            return err("concurrency must be positive".to_string());
        }
        let mut ids = HashMap::new();
        for engine in &self.engines {
            if let Some(other) = ids.insert(engine.id.as_str(), &engine.path) {
                return err(format!(
                    "engine id '{}' used by both {} and {}",
                    engine.id,
                    other.display(),
                    engine.path.display()
                ));
            }
        }
        Ok(())
    }
}

/// Final state of a tournament.
#[derive(Debug, Clone)]
pub struct TournamentReport {
    /// Game log.
    pub log: PathBuf,
    /// Games recorded, including those of a resumed run.
    pub games: u64,
    /// `None` when the pairings ran out first.
    pub stop_reason: Option<StopReason>,
    pub pairs: Vec<PairEstimate>,
    /// Per engine score against the field.
    pub totals: Vec<(String, Wdl)>,
    pub sprt: Option<SprtState>,
}

impl Display for TournamentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} games, log: {}", self.games, self.log.display())?;
        for pair in &self.pairs {
            write!(f, "{} vs {}: {}", pair.first, pair.second, pair.stats.total())?;
            match &pair.estimate {
                Some(estimate) => writeln!(f, ", {estimate}")?,
                None => writeln!(f)?,
            }
        }
        if self.totals.len() > 2 {
            for (engine, wdl) in &self.totals {
                writeln!(f, "{engine}: {wdl}")?;
            }
        }
        if let Some(sprt) = &self.sprt {
            writeln!(f, "SPRT: {sprt}")?;
        }
        Ok(())
    }
}

/// Runs a tournament between engines created by `F`.
pub struct Tournament<F: EngineFactory> {
    factory: Arc<F>,
    config: TournamentConfig,
    configuration: Configuration,
    constraints: Constraints,
    /// Recorded games after which the log stops accepting writes.
    #[cfg(test)]
    break_log_after: Option<u64>,
}

impl Tournament<UciEngineFactory> {
    /// Tournament between UCI engine processes.
    pub fn new(
        config: TournamentConfig,
        configuration: Configuration,
        constraints: Constraints,
    ) -> Tournament<UciEngineFactory> {
        let factory = UciEngineFactory::new(configuration, constraints.clone());
        Self::with_factory(factory, config, configuration, constraints)
    }
}

impl<F: EngineFactory> Tournament<F> {
    /// Tournament between engines created by `factory`.
    #[instrument(skip_all)]
    pub fn with_factory(
        factory: F,
        config: TournamentConfig,
        configuration: Configuration,
        constraints: Constraints,
    ) -> Tournament<F> {
        if configuration.log {
            match init_logger() {
                Ok(path) => info!("logging to {}", path.display()),
                Err(e) => warn!("file logging not enabled: {e:#}"),
            }
        }
        trace!(?config, ?configuration, ?constraints);

        Tournament {
            factory: Arc::new(factory),
            config,
            configuration,
            constraints,
            #[cfg(test)]
            break_log_after: None,
        }
    }

    /// Run the tournament to completion.
    ///
    /// # Errors
    /// A [`TournamentError`] (wrapped in [`anyhow::Error`]) for invalid settings, repeated
    /// startup failures or an unwritable log; other errors for I/O problems around the log.
    #[instrument(skip_all)]
    pub fn run(&self) -> anyhow::Result<TournamentReport> {
        // 1. nothing is created before the settings are known to be good
        self.config.validate()?;
        let book = match &self.config.opening_book {
            Some(path) => OpeningBook::load(path)
                .map_err(|e| TournamentError::Config(format!("{e:#}")))?,
            None => OpeningBook::standard(),
        };
        let ids: Vec<String> = self.config.engines.iter().map(|e| e.id.clone()).collect();
        let mut evaluator = SequentialEvaluator::new(self.config.mode, ids.clone())
            .map_err(|e| TournamentError::Config(e.to_string()))?;

        // 2. open the log, replaying it when resuming
        let (mut recorder, seed) = self.open_recorder(&ids, &mut evaluator)?;
        info!(seed, log = %recorder.path().display(), "tournament starting");

        // 3. pairings and scheduler
        self.constraints.check_concurrency(self.config.concurrency);
        let engines = self.config.engines.iter().cloned().map(Arc::new).collect();
        let openings = OpeningSource::new(book, self.config.opening_order, seed);
        let pairings = RoundRobin::new(engines, openings, self.config.repeat);
        let mut scheduler = TournamentScheduler::new(
            pairings,
            self.config.concurrency,
            self.config.mode.max_games(),
        )
        .with_completed(evaluator.rounds().clone());
        let mut stop_reason = match evaluator.progress() {
            Progress::Stop(reason) => {
                scheduler.stop();
                Some(reason)
            }
            Progress::Continue => None,
        };

        // 4. game threads catch their own panics, so every launched game sends a result
        if self.configuration.verbose {
            disable_line_wrap();
        }

        let (tx_result, rx_result) = mpsc::channel();
        let running = Arc::new(Mutex::new(vec![]));
        let settings = GameSettings {
            time_control: self.constraints.time_control(),
            rules: self.config.adjudication,
        };
        for pairing in scheduler.advance() {
            self.launch_game(pairing, settings, tx_result.clone(), &running);
        }

        // 5. main loop: record, evaluate, refill
        let mut startup_failures: HashMap<&str, u32> = HashMap::new();
        let mut fatal: Option<TournamentError> = None;
        while !scheduler.is_finished() {
            // not finished <=> game running <=> result to receive
            let result: GameResult = rx_result
                .recv()
                .context("game threads disconnected")?;

            #[cfg(test)]
            if self.break_log_after == Some(evaluator.games()) {
                recorder.reopen_read_only()?;
            }

            if matches!(fatal, Some(TournamentError::RecorderWrite { .. })) {
                warn!("discarding unrecorded result {result}");
            } else if let Err(e) = recorder.append(&result) {
                error!("{e}");
                scheduler.stop();
                fatal = Some(e);
            } else {
                let progress = evaluator.update(&result);
                if self.configuration.verbose {
                    print_game_result(&result, &evaluator.status_line());
                }
                if let Progress::Stop(reason) = progress {
                    if stop_reason.is_none() {
                        info!(?reason, games = evaluator.games(), "stopping condition reached");
                        stop_reason = Some(reason);
                    }
                    scheduler.stop();
                }
                if fatal.is_none() {
                    if let Some(abort) = self.track_startup_failures(&mut startup_failures, &result)
                    {
                        error!("{abort}");
                        scheduler.stop();
                        fatal = Some(abort);
                    }
                }
            }

            for pairing in scheduler.on_result(&result) {
                self.launch_game(pairing, settings, tx_result.clone(), &running);
            }
        }

        if self.configuration.verbose {
            enable_line_wrap();
        }
        if let Some(e) = fatal {
            return Err(e.into());
        }

        info!(games = evaluator.games(), ?stop_reason, "tournament finished");
        Ok(TournamentReport {
            log: recorder.path().to_path_buf(),
            games: evaluator.games(),
            stop_reason,
            pairs: evaluator.pair_estimates(),
            totals: ids
                .iter()
                .map(|id| (id.clone(), evaluator.engine_totals(id)))
                .collect(),
            sprt: evaluator.sprt_state(),
        })
    }

    fn open_recorder(
        &self,
        ids: &[String],
        evaluator: &mut SequentialEvaluator,
    ) -> anyhow::Result<(ResultRecorder, u64)> {
        let meta = |seed| TournamentMeta {
            mode: self.config.mode,
            engines: ids.to_vec(),
            seed,
            time_control: self.constraints.time_control().to_string(),
            repeat: self.config.repeat,
            openings: self.config.opening_book.clone(),
            started: String::new(),
        };

        match &self.config.resume {
            Some(path) => {
                let (recorder, logged, games) = ResultRecorder::open_existing(path)
                    .map_err(|e| TournamentError::Config(format!("cannot resume: {e:#}")))?;
                let seed = self.config.seed.unwrap_or(logged.seed);
                if !logged.is_compatible(&meta(seed)) {
                    return Err(TournamentError::Config(format!(
                        "{} was written by a tournament with different settings",
                        path.display()
                    ))
                    .into());
                }
                evaluator.replay(&games);
                info!(games = games.len(), "resuming {}", path.display());
                Ok((recorder, seed))
            }
            None => {
                let seed = self.config.seed.unwrap_or_else(rand::random);
                let recorder = ResultRecorder::create(&self.config.output_dir, &meta(seed))?;
                Ok((recorder, seed))
            }
        }
    }

    /// Count consecutive startup failures per engine. Returns the abort error once an engine
    /// reaches the threshold.
    fn track_startup_failures<'a>(
        &'a self,
        counts: &mut HashMap<&'a str, u32>,
        result: &GameResult,
    ) -> Option<TournamentError> {
        for engine in &self.config.engines {
            let id = engine.id.as_str();
            if id != result.white && id != result.black {
                continue;
            }
            let count = counts.entry(id).or_default();
            if result.failed_startup(id) {
                *count += 1;
                let max = self.config.max_startup_failures;
                if max > 0 && *count >= max {
                    return Some(TournamentError::StartupAbort {
                        engine: id.to_string(),
                        failures: *count,
                    });
                }
            } else {
                *count = 0;
            }
        }
        None
    }

    fn launch_game(
        &self,
        pairing: Pairing,
        settings: GameSettings,
        tx_result: Sender<GameResult>,
        running: &Arc<Mutex<Vec<Pairing>>>,
    ) {
        let factory = self.factory.clone();
        let mutex = running.clone();

        let mut guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push(pairing.clone());
        if self.configuration.verbose {
            print_running_games(&guard);
        }
        drop(guard);

        std::thread::spawn(move || {
            let start = Instant::now();
            // engines are dropped, and so terminated, while unwinding
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut white = factory.create(&pairing.white);
                let mut black = factory.create(&pairing.black);
                play_game(&pairing, &mut white, &mut black, &settings)
            }))
            .unwrap_or_else(|payload| {
                let message = panic_message(&*payload);
                error!("round {} aborted by a panic: {message}", pairing.round);
                GameResult::aborted(&pairing, start.elapsed())
            });

            remove_running_game(&mutex, &pairing);
            if tx_result.send(result).is_err() {
                warn!("result of round {} arrived after the tournament ended", pairing.round);
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn remove_running_game(mutex: &Mutex<Vec<Pairing>>, pairing: &Pairing) {
    let mut guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.iter().position(|p| p.round == pairing.round) {
        Some(pos) => {
            guard.remove(pos);
        }
        None => error!("got result of round {} that was not started", pairing.round),
    }
}

fn print_game_result(result: &GameResult, status: &str) {
    // clear line, green game, result, red failures, default
    let failures = result
        .failures
        .iter()
        .map(|f| f.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    println!(
        "\x1b[2K\x1b[32m{result}\x1b[39m {status} \x1b[31m{failures}\x1b[39m\x1b[0G"
    );
}

fn print_running_games(running: &[Pairing]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(Pairing::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
