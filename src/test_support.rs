//! In-memory engines for unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    engine::{
        Engine, EngineConfig, EngineError, EngineFactory, EngineState, Score, SearchLimits,
        SearchReply,
    },
    opening_book::OpeningPosition,
};

/// Knight shuffle, legal forever from the start position.
const SHUFFLE: [&str; 4] = ["g1f3", "g8f6", "f3g1", "f6g8"];

/// How a [`ScriptedEngine`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    FailStartup,
    /// Disconnects on its n+1-th search.
    CrashAfter(u32),
    TimeoutAfter(u32),
    /// Unparseable output on the first search.
    Garbage,
    /// Plays n moves, then reports no move with this score.
    NoMoveAfter(u32, Score),
    /// Panics on its first search.
    Panic,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct ScriptedEngine {
    id: String,
    behavior: Behavior,
    state: EngineState,
    searches: u32,
    ply: usize,
    counters: Counters,
}

impl ScriptedEngine {
    pub fn new(id: &str, behavior: Behavior) -> ScriptedEngine {
        ScriptedEngine {
            id: id.to_string(),
            behavior,
            state: EngineState::Uninitialized,
            searches: 0,
            ply: 0,
            counters: Counters::default(),
        }
    }

    pub fn terminated(&self) -> bool {
        self.state == EngineState::Terminated
    }

    fn invalid_state(&self, expected: EngineState) -> EngineError {
        EngineError::InvalidState {
            engine: self.id.clone(),
            state: self.state,
            expected,
        }
    }
}

impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Uninitialized {
            return Err(self.invalid_state(EngineState::Uninitialized));
        }
        if self.behavior == Behavior::FailStartup {
            self.state = EngineState::Terminated;
            return Err(EngineError::StartupFailure {
                engine: self.id.clone(),
                reason: "scripted".to_string(),
            });
        }
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);
        self.state = EngineState::Ready;
        Ok(())
    }

    fn set_position(
        &mut self,
        _opening: &OpeningPosition,
        moves: &[String],
    ) -> Result<(), EngineError> {
        if self.state != EngineState::Ready {
            return Err(self.invalid_state(EngineState::Ready));
        }
        self.ply = moves.len();
        Ok(())
    }

    fn think(&mut self, limits: &SearchLimits) -> Result<SearchReply, EngineError> {
        if self.state != EngineState::Ready {
            return Err(self.invalid_state(EngineState::Ready));
        }
        let played = self.searches;
        self.searches += 1;
        let engine = self.id.clone();
        match self.behavior {
            Behavior::CrashAfter(n) if played >= n => {
                self.state = EngineState::Terminated;
                return Err(EngineError::Disconnected { engine });
            }
            Behavior::TimeoutAfter(n) if played >= n => {
                return Err(EngineError::TimeForfeit {
                    engine,
                    budget_ms: limits.time_left().as_millis() as u64,
                })
            }
            Behavior::Garbage => {
                return Err(EngineError::ProtocolError {
                    engine,
                    reason: "expected bestmove, got 'hello'".to_string(),
                })
            }
            Behavior::Panic => panic!("{} has a bug", self.id),
            Behavior::NoMoveAfter(n, score) if played >= n => {
                return Ok(SearchReply {
                    best_move: "(none)".to_string(),
                    score: Some(score),
                })
            }
            _ => {}
        }
        // long enough for concurrent games to overlap
        std::thread::sleep(Duration::from_millis(1));
        Ok(SearchReply {
            best_move: SHUFFLE[self.ply % SHUFFLE.len()].to_string(),
            score: Some(Score::Cp(0)),
        })
    }

    fn terminate(&mut self) {
        if matches!(self.state, EngineState::Ready | EngineState::Thinking) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        self.state = EngineState::Terminated;
    }
}

/// Creates [`ScriptedEngine`]s, [`Behavior::Normal`] unless told otherwise.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    behaviors: HashMap<String, Behavior>,
    counters: Counters,
}

impl ScriptedFactory {
    pub fn new() -> ScriptedFactory {
        ScriptedFactory::default()
    }

    pub fn with_behavior(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(id.to_string(), behavior);
        self
    }

    /// Most engines running at the same time.
    pub fn peak(&self) -> Arc<AtomicUsize> {
        self.counters.peak.clone()
    }

    /// Engines successfully started.
    pub fn started(&self) -> Arc<AtomicUsize> {
        self.counters.started.clone()
    }
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    fn create(&self, config: &EngineConfig) -> ScriptedEngine {
        let behavior = self
            .behaviors
            .get(&config.id)
            .copied()
            .unwrap_or(Behavior::Normal);
        ScriptedEngine {
            counters: self.counters.clone(),
            ..ScriptedEngine::new(&config.id, behavior)
        }
    }
}
