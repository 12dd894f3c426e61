//! Deterministic UCI engine for tests. Shuffles knights forever.

use std::io::{self, BufRead, Write};

use clap::Parser;

const SHUFFLE: [&str; 4] = ["g1f3", "g8f6", "f3g1", "f6g8"];

#[derive(Parser)]
#[command(name = "mock-engine")]
struct Flags {
    /// Exit before reading anything
    #[arg(long)]
    fail_startup: bool,
    /// Never answer `uci`
    #[arg(long)]
    no_handshake: bool,
    /// Never answer `go`
    #[arg(long)]
    hang: bool,
    /// Exit after playing N moves
    #[arg(long, value_name = "N")]
    crash_after: Option<u32>,
    /// Answer `go` with a `bestmove` line without a move
    #[arg(long)]
    garbage: bool,
    /// Centipawn score reported with every move
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    score: i32,
}

fn main() -> io::Result<()> {
    let flags = Flags::parse();
    if flags.fail_startup {
        std::process::exit(1);
    }

    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    let mut ply = 0;
    let mut played = 0;

    for line in stdin.lock().lines() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("uci") if !flags.no_handshake => {
                writeln!(out, "id name mock-engine")?;
                writeln!(out, "id author enginetest")?;
                writeln!(out, "uciok")?;
            }
            Some("isready") if !flags.no_handshake => writeln!(out, "readyok")?,
            Some("position") => {
                ply = tokens.skip_while(|t| *t != "moves").skip(1).count();
            }
            Some("go") if flags.hang => {}
            Some("go") if flags.garbage => writeln!(out, "bestmove")?,
            Some("go") => {
                if flags.crash_after.is_some_and(|n| played >= n) {
                    std::process::exit(3);
                }
                writeln!(out, "info string thinking hard")?;
                writeln!(out, "info depth 1 score cp {} pv {}", flags.score, SHUFFLE[ply % 4])?;
                writeln!(out, "bestmove {}", SHUFFLE[ply % 4])?;
                played += 1;
            }
            Some("quit") => break,
            _ => {}
        }
        out.flush()?;
    }
    Ok(())
}
