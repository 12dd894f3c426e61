use std::{fs::File, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use time::{
    format_description::{self, parse},
    OffsetDateTime, UtcOffset,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

const LOG_FILE_FORMAT: &str = "[year]-[month]-[day]_[hour]-[minute]-[second]_log.txt";

/// Send every trace event to a new log file in the current directory.
///
/// Fails if the file cannot be created or if a global subscriber is already set.
pub fn init_logger() -> anyhow::Result<PathBuf> {
    let file_name = PathBuf::from(local_timestamp(LOG_FILE_FORMAT)?);
    let file = File::create(&file_name)
        .with_context(|| format!("could not create log file {}", file_name.display()))?;
    let writer = BoxMakeWriter::new(Mutex::new(file));
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .context("invalid log time format")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber)
        .map_err(|e| anyhow!("could not set global default tracing subscriber: {e}"))?;
    Ok(file_name)
}

/// Current local time (UTC if the offset is unknown) rendered with a `time` format description.
pub(crate) fn local_timestamp(format: &str) -> anyhow::Result<String> {
    let format = parse(format).context("invalid timestamp format")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format).context("could not format timestamp")
}
