use std::collections::HashSet;

use tracing::trace;

use crate::{game_runner::GameResult, pairing::Pairing};

/// Admission control for games: at most `concurrency` in flight, at most `max_games` issued,
/// nothing new once stopped.
pub struct TournamentScheduler<P: Iterator<Item = Pairing>> {
    pairings: P,
    concurrency: usize,
    running: usize,
    issued: u64,
    max_games: Option<u64>,
    completed: HashSet<u64>,
    exhausted: bool,
    stopped: bool,
}

impl<P: Iterator<Item = Pairing>> TournamentScheduler<P> {
    pub fn new(pairings: P, concurrency: usize, max_games: Option<u64>) -> Self {
        TournamentScheduler {
            pairings,
            concurrency: concurrency.max(1),
            running: 0,
            issued: 0,
            max_games,
            completed: HashSet::new(),
            exhausted: false,
            stopped: false,
        }
    }

    /// Rounds already played in a previous run: skipped, but counted against `max_games`.
    pub fn with_completed(mut self, rounds: HashSet<u64>) -> Self {
        self.completed = rounds;
        self
    }

    /// Pairings to launch now.
    pub fn advance(&mut self) -> Vec<Pairing> {
        let mut to_run = vec![];
        while !self.stopped && !self.exhausted && self.running + to_run.len() < self.concurrency {
            if self.max_games.is_some_and(|max| self.issued >= max) {
                trace!("game count reached");
                self.exhausted = true;
                break;
            }
            let Some(pairing) = self.pairings.next() else {
                trace!("no more pairings");
                self.exhausted = true;
                break;
            };
            self.issued += 1;
            if self.completed.contains(&pairing.round) {
                trace!(round = pairing.round, "already played");
                continue;
            }
            to_run.push(pairing);
        }
        self.running += to_run.len();
        to_run
    }

    /// A game finished. Returns the pairings that may be launched in its place.
    pub fn on_result(&mut self, result: &GameResult) -> Vec<Pairing> {
        trace!(round = result.round, "game done");
        self.running = self.running.saturating_sub(1);
        self.advance()
    }

    /// Stop issuing pairings. Games in flight still complete.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Games in flight.
    pub fn running(&self) -> usize {
        self.running
    }

    /// Nothing will be issued anymore and every issued game reported back.
    pub fn is_finished(&self) -> bool {
        self.running == 0 && (self.stopped || self.exhausted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        engine::EngineConfig,
        game_runner::{GameOutcome, TerminationReason},
        opening_book::OpeningPosition,
    };

    fn pairings() -> impl Iterator<Item = Pairing> {
        let a = Arc::new(EngineConfig::new("a", "/bin/a"));
        let b = Arc::new(EngineConfig::new("b", "/bin/b"));
        (0..).map(move |round| Pairing {
            round,
            white: a.clone(),
            black: b.clone(),
            opening: OpeningPosition::startpos(),
        })
    }

    fn result(pairing: &Pairing) -> GameResult {
        GameResult {
            round: pairing.round,
            white: pairing.white.id.clone(),
            black: pairing.black.id.clone(),
            opening_id: 0,
            outcome: GameOutcome::Draw,
            reason: TerminationReason::MoveLimit,
            plies: 0,
            duration_ms: 0,
            moves: vec![],
            failures: vec![],
        }
    }

    #[test]
    fn never_exceeds_concurrency_in_any_completion_order() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let concurrency = rng.gen_range(1..6);
            let max_games = rng.gen_range(0..40);
            let mut scheduler = TournamentScheduler::new(pairings(), concurrency, Some(max_games));

            let mut in_flight = scheduler.advance();
            let mut done = vec![];
            while !in_flight.is_empty() {
                assert!(in_flight.len() <= concurrency);
                assert_eq!(in_flight.len(), scheduler.running());
                let finished = in_flight.swap_remove(rng.gen_range(0..in_flight.len()));
                in_flight.extend(scheduler.on_result(&result(&finished)));
                done.push(finished.round);
            }
            assert!(scheduler.is_finished());
            done.sort_unstable();
            assert_eq!(done, (0..max_games).collect::<Vec<_>>(), "seed {seed}");
        }
    }

    #[test]
    fn stop_lets_running_games_finish() {
        let mut scheduler = TournamentScheduler::new(pairings(), 3, None);
        let first = scheduler.advance();
        assert_eq!(first.len(), 3);

        scheduler.stop();
        assert!(scheduler.on_result(&result(&first[0])).is_empty());
        assert!(!scheduler.is_finished());
        assert!(scheduler.on_result(&result(&first[1])).is_empty());
        assert!(scheduler.on_result(&result(&first[2])).is_empty());
        assert!(scheduler.is_finished());
    }

    #[test]
    fn completed_rounds_are_skipped_but_counted() {
        let mut scheduler =
            TournamentScheduler::new(pairings(), 10, Some(5)).with_completed(HashSet::from([0, 2]));
        let rounds: Vec<_> = scheduler.advance().iter().map(|p| p.round).collect();
        assert_eq!(rounds, vec![1, 3, 4]);
    }

    #[test]
    fn finite_pairings_exhaust() {
        let mut scheduler = TournamentScheduler::new(pairings().take(2), 4, None);
        let issued = scheduler.advance();
        assert_eq!(issued.len(), 2);
        for p in &issued {
            scheduler.on_result(&result(p));
        }
        assert!(scheduler.is_finished());
    }
}
