//! Append-only, durable game log.
//!
//! The log is a JSON-lines file: a `meta` record describing the tournament, then one `game`
//! record per finished game, in completion order. Every append is flushed to disk before it
//! returns, so a result is only handed to the evaluator once it can be replayed.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    evaluator::EvaluationMode, game_runner::GameResult, logger::local_timestamp,
    tournament::TournamentError,
};

const LOG_FILE_FORMAT: &str = "enginetest_[year]-[month]-[day]_[hour]-[minute]-[second]";
const TIMESTAMP_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]:[second]";

/// Tournament description written at the top of every log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentMeta {
    pub mode: EvaluationMode,
    /// Engine ids, in tournament order.
    pub engines: Vec<String>,
    pub seed: u64,
    pub time_control: String,
    pub repeat: bool,
    /// Opening book file, if any.
    pub openings: Option<PathBuf>,
    /// Local start time.
    #[serde(default)]
    pub started: String,
}

impl TournamentMeta {
    /// Another run may continue this log: same everything but the start time.
    pub fn is_compatible(&self, other: &TournamentMeta) -> bool {
        TournamentMeta {
            started: String::new(),
            ..self.clone()
        } == TournamentMeta {
            started: String::new(),
            ..other.clone()
        }
    }
}

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRecord {
    Meta(TournamentMeta),
    Game(GameResult),
}

/// Writer side of the log.
#[derive(Debug)]
pub struct ResultRecorder {
    path: PathBuf,
    file: File,
}

impl ResultRecorder {
    /// Create a new timestamped log in `directory` and write `meta` to it.
    ///
    /// Never overwrites an existing file: a numeric suffix is added on collision.
    pub fn create(directory: &Path, meta: &TournamentMeta) -> anyhow::Result<ResultRecorder> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("could not create directory {}", directory.display()))?;
        let stem = local_timestamp(LOG_FILE_FORMAT)?;
        let meta = TournamentMeta {
            started: local_timestamp(TIMESTAMP_FORMAT)?,
            ..meta.clone()
        };

        for attempt in 0..1000 {
            let name = if attempt == 0 {
                format!("{stem}.jsonl")
            } else {
                format!("{stem}_{attempt}.jsonl")
            };
            let path = directory.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let mut recorder = ResultRecorder { path, file };
                    recorder.write_record(&LogRecord::Meta(meta))?;
                    info!("recording games to {}", recorder.path.display());
                    return Ok(recorder);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("could not create {}", path.display()))
                }
            }
        }
        bail!("could not find a free log file name in {}", directory.display())
    }

    /// Reopen an existing log for appending. Returns its meta record and the games it holds.
    ///
    /// A torn last line, left by a crash mid-append, is cut off.
    pub fn open_existing(
        path: &Path,
    ) -> anyhow::Result<(ResultRecorder, TournamentMeta, Vec<GameResult>)> {
        let log = read_log(path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("could not open {}", path.display()))?;
        if let Some(valid_len) = log.valid_len {
            warn!(
                "dropping incomplete last record of {} (kept {valid_len} bytes)",
                path.display()
            );
            file.set_len(valid_len)
                .with_context(|| format!("could not truncate {}", path.display()))?;
        }
        let recorder = ResultRecorder {
            path: path.to_path_buf(),
            file,
        };
        Ok((recorder, log.meta, log.games))
    }

    /// Append one result and wait until it is on disk.
    pub fn append(&mut self, result: &GameResult) -> Result<(), TournamentError> {
        self.write_record(&LogRecord::Game(result.clone()))
            .map_err(|e| TournamentError::RecorderWrite {
                path: self.path.clone(),
                reason: format!("{e:#}"),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap the log for a read-only handle, so that every later append fails.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> std::io::Result<()> {
        self.file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(())
    }

    fn write_record(&mut self, record: &LogRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record).context("could not serialize record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .context("could not write record")?;
        self.file.flush().context("could not flush log")?;
        self.file.sync_data().context("could not sync log")
    }
}

struct ParsedLog {
    meta: TournamentMeta,
    games: Vec<GameResult>,
    /// Set when the file ends with a partial record: length of the valid prefix.
    valid_len: Option<u64>,
}

/// Read a log: its meta record and every complete game record.
pub fn replay(path: &Path) -> anyhow::Result<(TournamentMeta, Vec<GameResult>)> {
    let log = read_log(path)?;
    Ok((log.meta, log.games))
}

fn read_log(path: &Path) -> anyhow::Result<ParsedLog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    let mut meta = None;
    let mut games = vec![];
    let mut offset = 0u64;
    let mut valid_len = None;
    let mut lines = text.split_inclusive('\n').enumerate().peekable();
    while let Some((number, line)) = lines.next() {
        let is_last = lines.peek().is_none();
        let start = offset;
        offset += line.len() as u64;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Meta(m)) if meta.is_none() => meta = Some(m),
            Ok(LogRecord::Meta(_)) => bail!("{}:{}: second meta record", path.display(), number + 1),
            Ok(LogRecord::Game(game)) => games.push(game),
            Err(_) if is_last && !line.ends_with('\n') => valid_len = Some(start),
            Err(e) => {
                return Err(e).with_context(|| format!("{}:{}", path.display(), number + 1))
            }
        }
    }

    let meta = meta.with_context(|| format!("{} has no meta record", path.display()))?;
    Ok(ParsedLog {
        meta,
        games,
        valid_len,
    })
}
