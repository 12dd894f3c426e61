//! Opening positions and the order in which games receive them.
//!
//! A book file holds one position per line:
//!
//! ```text
//! # comments and blank lines are skipped
//! rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1
//! r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - id "italian";
//! e2e4 e7e5 g1f3 b8c6
//! startpos moves d2d4 d7d5
//! ```
//!
//! Lines containing a `/` are FEN or EPD records (trailing EPD opcodes are ignored and a
//! `moves ...` suffix is honoured); anything else is a sequence of UCI move tokens played from
//! the standard start position. Tokens are only checked for shape, never for legality.

use std::{path::Path, str::SplitWhitespace};

use anyhow::{bail, Context};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::Color;

/// A starting position: either the standard one or a FEN, plus moves leading from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningPosition {
    /// Index in the book.
    pub id: usize,
    /// `None` for the standard start position.
    pub fen: Option<String>,
    /// Moves played from `fen` before the engines take over.
    pub moves: Vec<String>,
}

impl OpeningPosition {
    /// The standard start position with no moves.
    pub fn startpos() -> OpeningPosition {
        OpeningPosition {
            id: 0,
            fen: None,
            moves: vec![],
        }
    }

    /// Side to move once the opening moves have been played.
    pub fn side_to_move(&self) -> Color {
        let initial = match &self.fen {
            Some(fen) if fen.split_whitespace().nth(1) == Some("b") => Color::Black,
            _ => Color::White,
        };
        if self.moves.len() % 2 == 0 {
            initial
        } else {
            initial.opposite()
        }
    }

    /// UCI `position` command for this opening followed by `game_moves`.
    pub fn uci_position(&self, game_moves: &[String]) -> String {
        let mut command = match &self.fen {
            Some(fen) => format!("position fen {fen}"),
            None => "position startpos".to_string(),
        };
        if !self.moves.is_empty() || !game_moves.is_empty() {
            command.push_str(" moves");
            for m in self.moves.iter().chain(game_moves) {
                command.push(' ');
                command.push_str(m);
            }
        }
        command
    }
}

/// Finite, ordered pool of opening positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningBook {
    positions: Vec<OpeningPosition>,
}

impl OpeningBook {
    /// A pool holding only the standard start position.
    pub fn standard() -> OpeningBook {
        OpeningBook {
            positions: vec![OpeningPosition::startpos()],
        }
    }

    /// Read a book file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<OpeningBook> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read opening book '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid opening book '{}'", path.display()))
    }

    /// Parse book contents. An empty book is an error.
    pub fn parse(text: &str) -> anyhow::Result<OpeningBook> {
        let mut positions = vec![];
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let position = parse_line(positions.len(), line)
                .with_context(|| format!("line {}", number + 1))?;
            positions.push(position);
        }
        if positions.is_empty() {
            bail!("no positions found");
        }
        Ok(OpeningBook { positions })
    }

    /// Position at `index`.
    pub fn get(&self, index: usize) -> Option<&OpeningPosition> {
        self.positions.get(index)
    }

    /// Pool size.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false for a parsed book.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn parse_line(id: usize, line: &str) -> anyhow::Result<OpeningPosition> {
    let mut tokens = line.split_whitespace();
    if line.contains('/') {
        let fen = parse_fen(&mut tokens)?;
        let moves = match tokens.next() {
            Some("moves") => collect_moves(tokens)?,
            // EPD opcodes
            _ => vec![],
        };
        Ok(OpeningPosition {
            id,
            fen: Some(fen),
            moves,
        })
    } else {
        let mut tokens = tokens.peekable();
        if tokens.peek() == Some(&"startpos") {
            tokens.next();
        }
        if tokens.peek() == Some(&"moves") {
            tokens.next();
        }
        let moves = collect_moves(tokens)?;
        Ok(OpeningPosition {
            id,
            fen: None,
            moves,
        })
    }
}

fn parse_fen(tokens: &mut SplitWhitespace<'_>) -> anyhow::Result<String> {
    let placement = tokens.next().context("missing piece placement")?;
    if placement.split('/').count() != 8 {
        bail!("piece placement '{placement}' does not have 8 ranks");
    }
    let side = tokens.next().context("missing side to move")?;
    if side != "w" && side != "b" {
        bail!("side to move must be 'w' or 'b', got '{side}'");
    }
    let castling = tokens.next().context("missing castling rights")?;
    let en_passant = tokens.next().context("missing en passant square")?;

    // EPD records stop after four fields; FEN adds two counters
    let mut rest = tokens.clone();
    let counters = match (rest.next(), rest.next()) {
        (Some(half), Some(full)) if half.parse::<u32>().is_ok() && full.parse::<u32>().is_ok() => {
            *tokens = rest;
            format!("{half} {full}")
        }
        _ => "0 1".to_string(),
    };

    Ok(format!("{placement} {side} {castling} {en_passant} {counters}"))
}

fn collect_moves<'a>(tokens: impl Iterator<Item = &'a str>) -> anyhow::Result<Vec<String>> {
    tokens
        .map(|token| {
            if is_uci_move(token) {
                Ok(token.to_string())
            } else {
                bail!("'{token}' is not a UCI move")
            }
        })
        .collect()
}

fn is_uci_move(token: &str) -> bool {
    let bytes = token.as_bytes();
    let square = |file: u8, rank: u8| (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank);
    match bytes.len() {
        4 => square(bytes[0], bytes[1]) && square(bytes[2], bytes[3]),
        5 => {
            square(bytes[0], bytes[1])
                && square(bytes[2], bytes[3])
                && matches!(bytes[4], b'q' | b'r' | b'b' | b'n')
        }
        _ => false,
    }
}

/// How positions are drawn from the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OpeningOrder {
    /// Uniform draw without replacement within each pass over the book.
    #[default]
    Random,
    /// Book order, wrapping around.
    Sequential,
}

/// Infinite stream of openings drawn from a book.
///
/// Deterministic for a given book, order and seed.
#[derive(Debug)]
pub struct OpeningSource {
    book: OpeningBook,
    order: OpeningOrder,
    rng: StdRng,
    pass: Vec<usize>,
    cursor: usize,
}

impl OpeningSource {
    /// New source starting at the beginning of a pass.
    pub fn new(book: OpeningBook, order: OpeningOrder, seed: u64) -> OpeningSource {
        OpeningSource {
            book,
            order,
            rng: StdRng::seed_from_u64(seed),
            pass: vec![],
            cursor: 0,
        }
    }

    /// Next opening.
    pub fn next_opening(&mut self) -> OpeningPosition {
        if self.cursor >= self.pass.len() {
            self.pass = (0..self.book.len()).collect();
            if self.order == OpeningOrder::Random {
                self.pass.shuffle(&mut self.rng);
            }
            self.cursor = 0;
        }
        let index = self.pass[self.cursor];
        self.cursor += 1;
        self.book.positions[index].clone()
    }

    /// Pool size.
    pub fn pool_size(&self) -> usize {
        self.book.len()
    }
}
