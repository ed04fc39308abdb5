use crate::config::LogLevel;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Flushes the file sink when dropped; keep it alive until exit.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber: stderr always, plus `file` when set.
/// `RUST_LOG` overrides the configured level.
pub fn init(level: LogLevel, file: Option<&Path>) -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let mut guard = None;
    let mut failure = None;
    let file_layer = file.and_then(|path| match open_sink(path) {
        Ok((writer, worker)) => {
            guard = Some(worker);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        Err(err) => {
            failure = Some((path, err));
            None
        }
    });

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init();

    if let Some((path, err)) = failure {
        warn!(
            path = %path.display(),
            err = %err,
            "log file unavailable; logging to stderr only"
        );
    }
    LogGuard { _file: guard }
}

fn open_sink(path: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_appender::non_blocking(file))
}
