use std::{collections::VecDeque, fmt::Display, sync::Arc};

use crate::{
    engine::EngineConfig,
    opening_book::{OpeningPosition, OpeningSource},
};

/// One game to play: who has which color, from which opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Issue order, starting at 0. Unique within a tournament.
    pub round: u64,
    pub white: Arc<EngineConfig>,
    pub black: Arc<EngineConfig>,
    pub opening: OpeningPosition,
}

impl Display for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} VS {}]", self.white.id, self.black.id)
    }
}

/// Endless round robin over all engine pairs.
///
/// Every cycle draws one opening and plays it for each pair `i < j`. With `repeat`, each pair
/// plays the opening twice with colors swapped; otherwise colors alternate from one cycle to
/// the next. The sequence only depends on the engines, the opening source and `repeat`.
#[derive(Debug)]
pub struct RoundRobin {
    engines: Vec<Arc<EngineConfig>>,
    openings: OpeningSource,
    repeat: bool,
    cycle: u64,
    round: u64,
    queue: VecDeque<(usize, usize, OpeningPosition)>,
}

impl RoundRobin {
    pub fn new(engines: Vec<Arc<EngineConfig>>, openings: OpeningSource, repeat: bool) -> Self {
        RoundRobin {
            engines,
            openings,
            repeat,
            cycle: 0,
            round: 0,
            queue: VecDeque::new(),
        }
    }

    fn next_cycle(&mut self) {
        let opening = self.openings.next_opening();
        let n = self.engines.len();
        for i in 0..n {
            for j in i + 1..n {
                if self.repeat {
                    self.queue.push_back((i, j, opening.clone()));
                    self.queue.push_back((j, i, opening.clone()));
                } else if self.cycle % 2 == 0 {
                    self.queue.push_back((i, j, opening.clone()));
                } else {
                    self.queue.push_back((j, i, opening.clone()));
                }
            }
        }
        self.cycle += 1;
    }
}

impl Iterator for RoundRobin {
    type Item = Pairing;

    fn next(&mut self) -> Option<Pairing> {
        if self.engines.len() < 2 {
            return None;
        }
        if self.queue.is_empty() {
            self.next_cycle();
        }
        let (white, black, opening) = self.queue.pop_front()?;
        let pairing = Pairing {
            round: self.round,
            white: self.engines[white].clone(),
            black: self.engines[black].clone(),
            opening,
        };
        self.round += 1;
        Some(pairing)
    }
}
