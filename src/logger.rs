//! Tracing subscriber setup.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Context;
use time::{format_description, OffsetDateTime};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

use crate::configuration::ExperimentConfig;

/// Install the global tracing subscriber.
///
/// With `config.log` the trace goes to `<log_root>/<experiment>/<timestamp>_orchestrator.txt`,
/// otherwise to stderr.
pub fn init_logger(config: &ExperimentConfig) -> anyhow::Result<()> {
    let (writer, ansi, level) = if config.log {
        let path = orchestrator_log_path(&config.experiment_log_dir(), OffsetDateTime::now_utc())?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("could not create log file {}", path.display()))?;
        (BoxMakeWriter::new(file), false, Level::TRACE)
    } else {
        (BoxMakeWriter::new(std::io::stderr), true, Level::INFO)
    };

    let local_offset =
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(ansi)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "could not set global default tracing subscriber, one is probably already installed",
    )
}

fn orchestrator_log_path(dir: &Path, now: OffsetDateTime) -> anyhow::Result<PathBuf> {
    let format = format_description::parse("[year]-[month]-[day]_[hour].[minute].[second]")?;
    Ok(dir.join(format!("{}_orchestrator.txt", now.format(&format)?)))
}

/// Wall clock rendered for console heartbeats.
pub(crate) fn wall_clock() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_else(|| now.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_log_is_timestamped() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let path = orchestrator_log_path(Path::new("log/engines/adhoc"), at).unwrap();
        assert_eq!(
            path,
            PathBuf::from("log/engines/adhoc/2023-11-14_22.13.20_orchestrator.txt")
        );
    }
}
