//! [`Engine`] implementation driving an external UCI program over its standard streams.
//!
//! Engine output is read line by line on a dedicated thread and forwarded through a channel,
//! so that every wait on the engine is a `recv_timeout` against a deadline. Nothing in here
//! blocks for longer than the startup timeout, the time budget plus grace, or the shutdown
//! grace.

use std::{
    io::{BufRead, BufReader, BufWriter, Write},
    process::{ChildStdin, ChildStdout},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, instrument, trace, warn};

use crate::{
    cgroup_manager::LimitedProcess,
    configuration::Configuration,
    constraints::Constraints,
    engine::{
        Engine, EngineConfig, EngineError, EngineFactory, EngineState, Score, SearchLimits,
        SearchReply,
    },
    opening_book::OpeningPosition,
};

/// One session with a UCI engine process. The process lives at most as long as this value.
#[derive(Debug)]
pub struct UciEngine {
    config: EngineConfig,
    constraints: Constraints,
    configuration: Configuration,
    state: EngineState,
    process: Option<LimitedProcess>,
    stdin: Option<BufWriter<ChildStdin>>,
    lines: Option<Receiver<String>>,
    name: Option<String>,
}

impl UciEngine {
    /// An engine session that has not been started yet.
    pub fn new(
        config: EngineConfig,
        constraints: Constraints,
        configuration: Configuration,
    ) -> UciEngine {
        UciEngine {
            config,
            constraints,
            configuration,
            state: EngineState::Uninitialized,
            process: None,
            stdin: None,
            lines: None,
            name: None,
        }
    }

    /// Name announced with `id name`, once started.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn launch(&self) -> anyhow::Result<LimitedProcess> {
        let path = &self.config.path;
        let args = &self.config.args;
        let allow_stderr = self.configuration.debug_engine_stderr;
        let max_memory = self
            .constraints
            .engine_ram
            .map_or(0, |bytes| i64::try_from(bytes).unwrap_or(i64::MAX));
        match LimitedProcess::launch(path, args, max_memory, allow_stderr) {
            Ok(process) => Ok(process),
            // without a memory limit the process group is enough to reap the engine's tree
            Err(e) if self.constraints.engine_ram.is_none() => {
                debug!("running '{}' outside a cgroup: {e:#}", self.config.id);
                LimitedProcess::launch_without_container(path, args, allow_stderr)
            }
            Err(e) if self.configuration.allow_uncontained => {
                warn!(
                    "running '{}' without memory containment: {e:#}",
                    self.config.id
                );
                LimitedProcess::launch_without_container(path, args, allow_stderr)
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_reader(stdout: ChildStdout) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn handshake(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.constraints.startup_timeout;

        self.write_line("uci")?;
        loop {
            let line = self.recv_line(deadline).context("waiting for uciok")?;
            let line = line.trim();
            if line == "uciok" {
                break;
            }
            if let Some(name) = line.strip_prefix("id name ") {
                self.name = Some(name.trim().to_string());
            }
        }

        let options = self
            .config
            .options
            .iter()
            .map(|(name, value)| format!("setoption name {name} value {value}"))
            .collect::<Vec<_>>();
        for option in options {
            self.write_line(&option)?;
        }
        self.sync_ready(deadline)?;
        self.write_line("ucinewgame")?;
        self.sync_ready(deadline)
    }

    fn sync_ready(&mut self, deadline: Instant) -> anyhow::Result<()> {
        self.write_line("isready")?;
        while self.recv_line(deadline).context("waiting for readyok")?.trim() != "readyok" {}
        Ok(())
    }

    fn recv_line(&self, deadline: Instant) -> anyhow::Result<String> {
        let lines = self.lines.as_ref().context("engine output not connected")?;
        let timeout = deadline.saturating_duration_since(Instant::now());
        match lines.recv_timeout(timeout) {
            Ok(line) => {
                trace!(engine = %self.config.id, "< {line}");
                Ok(line)
            }
            Err(RecvTimeoutError::Timeout) => bail!("timed out"),
            Err(RecvTimeoutError::Disconnected) => bail!("engine exited"),
        }
    }

    fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        trace!(engine = %self.config.id, "> {line}");
        let stdin = self.stdin.as_mut().context("engine input not connected")?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn expect_state(&self, expected: EngineState) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                engine: self.config.id.clone(),
                state: self.state,
                expected,
            })
        }
    }

    fn disconnected(&self) -> EngineError {
        EngineError::Disconnected {
            engine: self.config.id.clone(),
        }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::ProtocolError {
            engine: self.config.id.clone(),
            reason: reason.into(),
        }
    }
}

impl Engine for UciEngine {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn state(&self) -> EngineState {
        self.state
    }

    #[instrument(skip_all, fields(engine = %self.config.id))]
    fn start(&mut self) -> Result<(), EngineError> {
        self.expect_state(EngineState::Uninitialized)?;

        let result = self.launch().and_then(|mut process| {
            let (stdin, stdout) = process
                .take_stdio()
                .ok_or_else(|| anyhow!("engine pipes unavailable"))?;
            self.process = Some(process);
            self.stdin = Some(BufWriter::new(stdin));
            self.lines = Some(Self::spawn_reader(stdout));
            self.handshake()
        });

        match result {
            Ok(()) => {
                debug!(name = ?self.name, "engine ready");
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.terminate();
                Err(EngineError::StartupFailure {
                    engine: self.config.id.clone(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    fn set_position(
        &mut self,
        opening: &OpeningPosition,
        moves: &[String],
    ) -> Result<(), EngineError> {
        self.expect_state(EngineState::Ready)?;
        self.write_line(&opening.uci_position(moves))
            .map_err(|_| self.disconnected())
    }

    fn think(&mut self, limits: &SearchLimits) -> Result<SearchReply, EngineError> {
        self.expect_state(EngineState::Ready)?;

        // leftovers from the previous search
        if let Some(lines) = &self.lines {
            while lines.try_recv().is_ok() {}
        }

        let budget = limits.time_left();
        self.write_line(&format!(
            "go wtime {} btime {} winc {} binc {}",
            limits.white_time.as_millis(),
            limits.black_time.as_millis(),
            limits.white_increment.as_millis(),
            limits.black_increment.as_millis(),
        ))
        .map_err(|_| self.disconnected())?;
        self.state = EngineState::Thinking;

        let deadline = Instant::now() + budget + self.constraints.think_grace;
        let mut score = None;
        loop {
            let lines = self.lines.as_ref().ok_or_else(|| self.disconnected())?;
            let timeout = deadline.saturating_duration_since(Instant::now());
            match lines.recv_timeout(timeout) {
                Ok(line) => {
                    trace!(engine = %self.config.id, "< {line}");
                    let mut tokens = line.split_whitespace();
                    match tokens.next() {
                        Some("info") => {
                            if let Some(s) = parse_score(tokens).map_err(|e| self.protocol_error(e))? {
                                score = Some(s);
                            }
                        }
                        Some("bestmove") => {
                            let best_move = tokens
                                .next()
                                .ok_or_else(|| self.protocol_error("bestmove without a move"))?
                                .to_string();
                            self.state = EngineState::Ready;
                            return Ok(SearchReply { best_move, score });
                        }
                        _ => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.write_line("stop");
                    return Err(EngineError::TimeForfeit {
                        engine: self.config.id.clone(),
                        budget_ms: budget.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.disconnected()),
            }
        }
    }

    #[instrument(skip_all, fields(engine = %self.config.id))]
    fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = self.write_line("quit");
            // closing stdin also tells well-behaved engines to exit
            self.stdin = None;
            let grace = self.constraints.shutdown_grace;
            if !process.wait_for_exit(grace) {
                debug!("engine ignored quit, killing process {}", process.id());
                if let Err(e) = process.try_kill(grace.max(Duration::from_millis(100))) {
                    warn!("could not kill engine process: {e:#}");
                }
            }
        }
        self.stdin = None;
        self.lines = None;
        self.state = EngineState::Terminated;
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// `score cp N` / `score mate N` from the tokens following `info`.
fn parse_score<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<Option<Score>, String> {
    let mut tokens = tokens.peekable();
    if tokens.peek() == Some(&"string") || !tokens.any(|t| t == "score") {
        return Ok(None);
    }
    let kind = tokens.next();
    let value = tokens.next();
    let parse = |v: Option<&str>| {
        v.and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| format!("invalid score value {v:?}"))
    };
    match kind {
        Some("cp") => parse(value).map(|v| Some(Score::Cp(v))),
        Some("mate") => parse(value).map(|v| Some(Score::Mate(v))),
        other => Err(format!("unknown score kind {other:?}")),
    }
}

/// Creates [`UciEngine`] sessions sharing the same limits and behavior flags.
#[derive(Debug, Clone)]
pub struct UciEngineFactory {
    configuration: Configuration,
    constraints: Constraints,
}

impl UciEngineFactory {
    pub fn new(configuration: Configuration, constraints: Constraints) -> UciEngineFactory {
        UciEngineFactory {
            configuration,
            constraints,
        }
    }
}

impl EngineFactory for UciEngineFactory {
    type Engine = UciEngine;

    fn create(&self, config: &EngineConfig) -> UciEngine {
        UciEngine::new(config.clone(), self.constraints.clone(), self.configuration)
    }
}
